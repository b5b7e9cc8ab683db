//! 同步管线 - 推送排空、拉取对账、冲突解析、实时摄入与状态观察

pub mod puller;
pub mod pusher;
pub mod realtime;
pub mod resolver;
pub mod status;

pub use puller::{PullReport, Puller};
pub use pusher::{DrainReport, Pusher};
pub use realtime::{ChannelState, RealtimeIngress, RecentWrites};
pub use resolver::{resolve, Resolution};
pub use status::{StatusObserver, SyncPhase, SyncStatusSnapshot};
