//! Stream kinds the VFS instantiates itself. Handler-backed file streams
//! live with their handlers.

pub mod anon;
pub mod dir;
pub mod epoll;
pub mod local;

pub use anon::AnonymousStream;
pub use dir::{DirEnt, DirectoryStream};
pub use epoll::EpollStream;
pub use local::{AbstractSocketNamespace, LocalSocket, LocalSocketMode, LocalSocketType};
