///////////////////
// Matrix macros //
///////////////////

/// Early return with a `DimensionMismatch` error if two matrices have a
/// different number of rows.
#[macro_export]
macro_rules! ensure_nrows {
    ($what:expr, $matrix1:expr, $matrix2:expr) => {
        if $matrix1.nrows() != $matrix2.nrows() {
            return Err($crate::error::FugwError::DimensionMismatch {
                what: $what,
                expected: $matrix1.nrows(),
                found: $matrix2.nrows(),
            });
        }
    };
}

/// Early return with a `DimensionMismatch` error if a dimension does not match
/// the expected size.
#[macro_export]
macro_rules! ensure_dim {
    ($what:expr, $expected:expr, $found:expr) => {
        if $expected != $found {
            return Err($crate::error::FugwError::DimensionMismatch {
                what: $what,
                expected: $expected,
                found: $found,
            });
        }
    };
}

///////////////////
// Vector macros //
///////////////////

/// Assertion that all vectors have the same length.
#[macro_export]
macro_rules! assert_same_len {
    ($($vec:expr),+ $(,)?) => {
        {
            let lengths: Vec<usize> = vec![$($vec.len()),+];
            let first_len = lengths[0];

            if !lengths.iter().all(|&len| len == first_len) {
                panic!(
                    "Vectors have different lengths: {:?}",
                    lengths
                );
            }
        }
    };
}
