//! Relay transport: connection abstraction and the session task

mod conn;
mod session;

pub use conn::{channel_conn, ChannelConn, ChannelConnector, Conn, Connector, RelayEnd, WsConnector};
pub use session::{
    spawn_session, ConnectionState, CredentialProvider, SessionHandle, StaticCredentials,
};
