//! Mock WebSocket client and server for integration testing of the
//! real-time transport without spinning up the full HTTP stack.

pub mod mock_ws_client;
pub mod mock_ws_server;

pub use mock_ws_client::MockWsClient;
pub use mock_ws_server::MockWsServer;
