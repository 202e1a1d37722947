// 连接注册表模块
//
// - `MessageSink`: 出站传输抽象（WebSocket 或测试桩）
// - `Connection`: 单个实时连接，串行化写入并带发送超时
// - `ClientRegistry`: 活跃连接集合，负责扇出广播

pub mod clients;
pub mod connection;

pub use clients::{BroadcastReport, ClientRegistry};
pub use connection::{Connection, MessageSink};

#[cfg(test)]
pub(crate) mod testing;
