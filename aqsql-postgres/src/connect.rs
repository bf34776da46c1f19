use aqsql_core::net::{connect_tcp, connect_uds, BoxSocket};
use aqsql_core::{ConnectOptions, Error, Result, Target};

pub(crate) async fn open_socket(options: &ConnectOptions) -> Result<BoxSocket> {
    match &options.target {
        Target::Tcp { host, port } => connect_tcp(host, *port).await.map_err(Error::ConnectionLost),
        Target::Unix { path } => connect_uds(path).await.map_err(Error::ConnectionLost),
    }
}
