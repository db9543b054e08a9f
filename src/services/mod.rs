pub mod clock;
pub mod delivery;
pub mod init;
pub mod scheduler;
