/////////////////////
// Checking macros //
/////////////////////

/// Return an `InvalidInput` error if the slices differ in length.
#[macro_export]
macro_rules! check_same_len {
    ($($vec:expr),+ $(,)?) => {
        {
            let lengths: Vec<usize> = vec![$($vec.len()),+];
            let first_len = lengths[0];

            if !lengths.iter().all(|&len| len == first_len) {
                return Err($crate::utils::errors::DoubletError::InvalidInput(format!(
                    "Inputs have different lengths: {:?}",
                    lengths
                )));
            }
        }
    };
}

/// Return an `InvalidInput` error if the two matrices differ in their number
/// of columns.
#[macro_export]
macro_rules! check_same_ncols {
    ($matrix1:expr, $matrix2:expr) => {
        if $matrix1.ncols() != $matrix2.ncols() {
            return Err($crate::utils::errors::DoubletError::InvalidInput(format!(
                "Matrices have different number of columns: {} != {}",
                $matrix1.ncols(),
                $matrix2.ncols()
            )));
        }
    };
}

/// Return an `InvalidInput` error if the condition does not hold.
#[macro_export]
macro_rules! ensure_input {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::utils::errors::DoubletError::InvalidInput(format!($($arg)+)));
        }
    };
}
