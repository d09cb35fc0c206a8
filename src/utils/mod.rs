pub use self::logger::{KernelLogger, LogSink};

pub mod logger;
