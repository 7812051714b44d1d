mod frames;
mod query;
mod ws;

pub use self::frames::{ClientFrame, ServerFrame};
pub use self::query::{BridgeRequest, WsRequest, parse_request};
pub use self::ws::{ServerContext, run_server};
