pub mod init;
pub mod vit;
