//! Out-of-band delivery channels.

pub mod channel;
pub mod drive;
pub mod email;
pub mod folder;
pub mod imap;

pub use channel::*;
pub use email::{EmailConfig, MailChannel};
pub use folder::{FolderConfig, RemoteFolderChannel};
