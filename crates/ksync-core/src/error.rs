use thiserror::Error;

use ksync_kernel::StorageError;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("kernel has been shut down")]
    ShutDown,
}
