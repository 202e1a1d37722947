// 服务端与浏览器之间共享的类型、线协议和错误定义

pub mod types;
pub mod protocol;
pub mod error;

pub use types::*;
pub use protocol::*;
pub use error::*;
