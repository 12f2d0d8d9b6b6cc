//! Internal helper macros.

/// Returns early with `$error` when `$predicate` does not hold.
///
/// Reads like `assert!`, but hands the failure back to the caller instead of panicking.
///
/// ```ignore
/// ensure!(options.block_size > 0, PoolConfigError::ZeroBlockSize);
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
