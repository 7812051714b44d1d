mod connection_mutex;
mod manager;
mod session;
mod state;

pub use self::connection_mutex::{ConnectionMutex, ConnectionToken};
pub use self::manager::SessionManager;
pub(crate) use self::manager::Registry;
pub use self::session::{AttachedClient, Session, SessionEvent, SocketId};

pub use self::state::{SessionState, StateMachine};
