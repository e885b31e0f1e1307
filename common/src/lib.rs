pub mod bit_buffer2;
pub mod buffer2;
pub mod file_format;
pub mod log_setup;

pub use bit_buffer2::BitBuffer2;
pub use buffer2::Buffer2;
pub use file_format::{FileFormatError, SerdeFormat};
pub use log_setup::{LogConfig, LogSetupError, setup_logging};
