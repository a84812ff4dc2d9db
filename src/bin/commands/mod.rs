mod queuectl;

pub use self::queuectl::*;
