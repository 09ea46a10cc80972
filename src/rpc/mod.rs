//! Line-delimited JSON over TCP.
//!
//! Each request is one JSON object on one line; the node answers with exactly
//! one JSON line per request, in order, on the same connection.

use std::{
    io::{BufRead, BufReader, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::Arc,
    thread,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    abi::Value,
    client::{ClientError, LedgerClient},
    identity::AccountId,
    ledger::{LedgerError, SignedTransaction, TxId, TxStatus},
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Accounts,
    Submit {
        tx: SignedTransaction,
    },
    Status {
        id: TxId,
    },
    Call {
        address: String,
        operation: String,
        args: Vec<Value>,
    },
}

impl Request {
    fn method(&self) -> &'static str {
        match self {
            Request::Accounts => "accounts",
            Request::Submit { .. } => "submit",
            Request::Status { .. } => "status",
            Request::Call { .. } => "call",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Accounts { accounts: Vec<AccountId> },
    Submitted { id: TxId },
    Status { status: TxStatus },
    Value { value: Value },
    Error { error: LedgerError },
}

fn into_ledger_error(err: ClientError) -> LedgerError {
    match err {
        ClientError::Ledger(err) => err,
        other => LedgerError::Unavailable(other.to_string()),
    }
}

/// Answer one request against `ledger`.
pub fn dispatch(ledger: &dyn LedgerClient, request: Request) -> Response {
    let result = match request {
        Request::Accounts => ledger
            .accounts()
            .map(|accounts| Response::Accounts { accounts }),
        Request::Submit { tx } => ledger.submit(tx).map(|id| Response::Submitted { id }),
        Request::Status { id } => ledger.status(&id).map(|status| Response::Status { status }),
        Request::Call {
            address,
            operation,
            args,
        } => ledger
            .call(&address, &operation, &args)
            .map(|value| Response::Value { value }),
    };
    result.unwrap_or_else(|err| Response::Error {
        error: into_ledger_error(err),
    })
}

/// Accept connections forever, one thread per connection.
pub fn serve(listener: TcpListener, ledger: Arc<dyn LedgerClient>) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "ledger node listening");
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let ledger = ledger.clone();
        thread::spawn(move || {
            let peer = stream.peer_addr().ok();
            if let Err(err) = handle_connection(stream, ledger.as_ref()) {
                debug!(?peer, error = %err, "connection closed with error");
            }
        });
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, ledger: &dyn LedgerClient) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!(method = request.method(), "rpc request");
                dispatch(ledger, request)
            }
            Err(err) => Response::Error {
                error: LedgerError::Malformed(err.to_string()),
            },
        };
        let mut frame = serde_json::to_vec(&response)?;
        frame.push(b'\n');
        writer.write_all(&frame)?;
        writer.flush()?;
    }
    Ok(())
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

/// Client side of the node protocol. Requests on one client are serialised
/// over a single connection.
pub struct RpcClient {
    addr: SocketAddr,
    conn: Mutex<Option<Connection>>,
}

impl RpcClient {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let addr = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            addr,
            conn: Mutex::new(Some(Connection {
                reader: BufReader::new(stream),
                writer,
            })),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.addr
    }

    fn request(&self, request: &Request) -> Result<Response, ClientError> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(ClientError::Closed)?;
        let mut frame = serde_json::to_vec(request)?;
        frame.push(b'\n');
        conn.writer.write_all(&frame)?;
        conn.writer.flush()?;
        let mut line = String::new();
        if conn.reader.read_line(&mut line)? == 0 {
            return Err(ClientError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "ledger node closed the connection",
            )));
        }
        match serde_json::from_str(&line)? {
            Response::Error { error } => Err(ClientError::Ledger(error)),
            response => Ok(response),
        }
    }

    fn unexpected(request: &Request, response: Response) -> ClientError {
        ClientError::UnexpectedResponse {
            request: request.method().to_string(),
            response: format!("{response:?}"),
        }
    }
}

impl LedgerClient for RpcClient {
    fn accounts(&self) -> Result<Vec<AccountId>, ClientError> {
        let request = Request::Accounts;
        match self.request(&request)? {
            Response::Accounts { accounts } => Ok(accounts),
            other => Err(Self::unexpected(&request, other)),
        }
    }

    fn submit(&self, tx: SignedTransaction) -> Result<TxId, ClientError> {
        let request = Request::Submit { tx };
        match self.request(&request)? {
            Response::Submitted { id } => Ok(id),
            other => Err(Self::unexpected(&request, other)),
        }
    }

    fn status(&self, id: &str) -> Result<TxStatus, ClientError> {
        let request = Request::Status { id: id.to_string() };
        match self.request(&request)? {
            Response::Status { status } => Ok(status),
            other => Err(Self::unexpected(&request, other)),
        }
    }

    fn call(&self, address: &str, operation: &str, args: &[Value]) -> Result<Value, ClientError> {
        let request = Request::Call {
            address: address.to_string(),
            operation: operation.to_string(),
            args: args.to_vec(),
        };
        match self.request(&request)? {
            Response::Value { value } => Ok(value),
            other => Err(Self::unexpected(&request, other)),
        }
    }

    fn close(&self) -> Result<(), ClientError> {
        if let Some(conn) = self.conn.lock().take() {
            let _ = conn.writer.shutdown(Shutdown::Both);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{LocalLedger, Mining},
        identity::Identity,
        ledger::{LedgerSettings, TransactionRequest, TxKind},
    };

    fn spawn_node() -> (Arc<LocalLedger>, SocketAddr) {
        let ledger = Arc::new(LocalLedger::open(&LedgerSettings::default(), Mining::Manual));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shared: Arc<dyn LedgerClient> = ledger.clone();
        thread::spawn(move || serve(listener, shared));
        (ledger, addr)
    }

    #[test]
    fn request_frames_are_tagged_by_method() {
        let json = serde_json::to_string(&Request::Status { id: "0x01".into() }).unwrap();
        assert_eq!(json, r#"{"method":"status","id":"0x01"}"#);
    }

    #[test]
    fn client_round_trips_through_a_node() {
        let (ledger, addr) = spawn_node();
        let client = RpcClient::connect(addr).unwrap();
        assert_eq!(client.accounts().unwrap().len(), 10);

        let tx = TransactionRequest::new(
            TxKind::Invoke {
                address: "0xabc".into(),
                operation: "voteForCandidate".into(),
                args: vec![],
            },
            100_000,
        )
        .sign(&Identity::dev(8545, 0));
        let id = client.submit(tx.clone()).unwrap();
        assert_eq!(client.status(&id).unwrap(), TxStatus::Pending);
        assert!(matches!(
            client.submit(tx),
            Err(ClientError::Ledger(LedgerError::DuplicateTransaction(_)))
        ));
        ledger.mine().unwrap();
        assert!(!client.status(&id).unwrap().is_pending());

        assert!(matches!(
            client.call("0xabc", "totalVotesFor", &[]),
            Err(ClientError::Ledger(LedgerError::NotYetAvailable(_)))
        ));
        client.close().unwrap();
        assert!(matches!(client.accounts(), Err(ClientError::Closed)));
    }

    #[test]
    fn garbage_lines_get_a_malformed_error() {
        let (_ledger, addr) = spawn_node();
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"{not json}\n").unwrap();
        let mut line = String::new();
        BufReader::new(stream.try_clone().unwrap())
            .read_line(&mut line)
            .unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        assert!(matches!(
            response,
            Response::Error {
                error: LedgerError::Malformed(_)
            }
        ));
    }
}
