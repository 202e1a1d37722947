// 实时流转发模块
//
// # 核心组件
//
// - `StreamHub`: 单个连接从握手到拆除的完整生命周期
// - `HubState`: 连接状态机
// - `FrameRatePacer`: 绝对截止时间的帧率控制器
// - `spawn_broadcast_pacer`: broadcast 分发模式下的单一节奏任务

pub mod broadcast;
pub mod pacer;
pub mod state;
pub mod stream_hub;

pub use broadcast::{spawn_broadcast_pacer, BroadcastStats};
pub use pacer::FrameRatePacer;
pub use state::{HubState, InvalidTransition};
pub use stream_hub::{HubReport, InboundEvent, StreamHub};

#[cfg(test)]
pub(crate) mod testing;
