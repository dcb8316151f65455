use std::io;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::btree::types::{write_bytes, write_u64, write_u8, ByteReader};
use crate::core::errors::SheafError;
use crate::core::Result;
use crate::db::Database;
use crate::session::SessionKind;

const OP_OPEN_SESSION: u8 = 1;
const OP_PUT: u8 = 2;
const OP_GET: u8 = 3;
const OP_REMOVE: u8 = 4;
const OP_COMMIT: u8 = 5;
const OP_ROLLBACK: u8 = 6;
const OP_CLOSE_SESSION: u8 = 7;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// Accept loop. Each connection gets its own task, a server-side session
/// and a scheduler binding; commands run as session tasks on that
/// scheduler, in arrival order.
pub async fn start_server(addr: &str, db: Arc<Database>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(SheafError::Io)?;
    info!("server listening on {addr}");
    loop {
        let (socket, peer) = listener.accept().await.map_err(SheafError::Io)?;
        let db = Arc::clone(&db);
        tokio::spawn(async move {
            debug!("connection from {peer}");
            if let Err(e) = handle_connection(socket, db).await {
                error!("connection {peer} failed: {e}");
            }
        });
    }
}

struct ConnectionState {
    session_id: Option<u64>,
}

async fn handle_connection(mut socket: TcpStream, db: Arc<Database>) -> Result<()> {
    let mut state = ConnectionState { session_id: None };
    loop {
        let mut len_buf = [0u8; 4];
        match socket.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let frame_len = LittleEndian::read_u32(&len_buf) as usize;
        if frame_len == 0 {
            return Err(SheafError::Protocol("empty frame".into()));
        }
        let mut frame = vec![0u8; frame_len];
        socket.read_exact(&mut frame).await.map_err(SheafError::Io)?;

        let opcode = frame[0];
        let payload = frame[1..].to_vec();
        let response = match handle_frame(&db, &mut state, opcode, payload).await {
            Ok(body) => {
                let mut out = Vec::with_capacity(body.len() + 1);
                write_u8(&mut out, STATUS_OK);
                out.extend_from_slice(&body);
                out
            }
            Err(e) => {
                let mut out = Vec::new();
                write_u8(&mut out, STATUS_ERROR);
                write_bytes(&mut out, e.to_string().as_bytes());
                out
            }
        };

        let mut framed = Vec::with_capacity(response.len() + 4);
        let mut len_prefix = [0u8; 4];
        LittleEndian::write_u32(&mut len_prefix, response.len() as u32);
        framed.extend_from_slice(&len_prefix);
        framed.extend_from_slice(&response);
        socket.write_all(&framed).await.map_err(SheafError::Io)?;
    }

    if let Some(session_id) = state.session_id.take() {
        db.remove_session(session_id);
    }
    Ok(())
}

async fn handle_frame(
    db: &Arc<Database>,
    state: &mut ConnectionState,
    opcode: u8,
    payload: Vec<u8>,
) -> Result<Vec<u8>> {
    match opcode {
        OP_OPEN_SESSION => {
            if state.session_id.is_some() {
                return Err(SheafError::Protocol("session already open".into()));
            }
            let (session, _) = db.create_session(SessionKind::Server)?;
            state.session_id = Some(session.id());
            let mut out = Vec::new();
            write_u64(&mut out, session.id());
            Ok(out)
        }
        OP_CLOSE_SESSION => {
            if let Some(session_id) = state.session_id.take() {
                db.remove_session(session_id);
            }
            Ok(Vec::new())
        }
        OP_PUT | OP_GET | OP_REMOVE | OP_COMMIT | OP_ROLLBACK => {
            let session_id = state
                .session_id
                .ok_or_else(|| SheafError::Protocol("no open session".into()))?;
            run_session_command(db, session_id, opcode, payload).await
        }
        other => Err(SheafError::Protocol(format!("unknown opcode {other}"))),
    }
}

/// Run one command as a session task on the session's scheduler and await
/// the result; per-session FIFO ordering comes from the scheduler.
async fn run_session_command(
    db: &Arc<Database>,
    session_id: u64,
    opcode: u8,
    payload: Vec<u8>,
) -> Result<Vec<u8>> {
    let scheduler = db
        .session_scheduler(session_id)
        .ok_or_else(|| SheafError::Protocol(format!("unknown session {session_id}")))?;
    let (tx, rx) = tokio::sync::oneshot::channel();
    let db = Arc::clone(db);
    scheduler.submit_session_task(session_id, move || {
        let result = execute_command(&db, session_id, opcode, &payload);
        let _ = tx.send(result);
    })?;
    rx.await
        .map_err(|_| SheafError::IllegalState("scheduler dropped the command".into()))?
}

fn execute_command(
    db: &Arc<Database>,
    session_id: u64,
    opcode: u8,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let session = db
        .session(session_id)
        .ok_or_else(|| SheafError::Protocol(format!("unknown session {session_id}")))?;
    match opcode {
        OP_PUT => {
            let mut reader = ByteReader::new(payload);
            let map_name = reader.read_string()?;
            let key = reader.read_bytes()?;
            let value = reader.read_bytes()?;
            let map = db.open_transaction_map::<Vec<u8>, Vec<u8>>(&map_name)?;
            let txn = session.transaction()?;
            let previous = map.put(&txn, key, value)?;
            let mut out = Vec::new();
            encode_optional(&mut out, previous);
            Ok(out)
        }
        OP_GET => {
            let mut reader = ByteReader::new(payload);
            let map_name = reader.read_string()?;
            let key = reader.read_bytes()?;
            let map = db.open_transaction_map::<Vec<u8>, Vec<u8>>(&map_name)?;
            let txn = session.transaction()?;
            let value = map.get(&txn, &key)?;
            let mut out = Vec::new();
            encode_optional(&mut out, value);
            Ok(out)
        }
        OP_REMOVE => {
            let mut reader = ByteReader::new(payload);
            let map_name = reader.read_string()?;
            let key = reader.read_bytes()?;
            let map = db.open_transaction_map::<Vec<u8>, Vec<u8>>(&map_name)?;
            let txn = session.transaction()?;
            let previous = map.remove(&txn, key)?;
            let mut out = Vec::new();
            encode_optional(&mut out, previous);
            Ok(out)
        }
        OP_COMMIT => {
            session.commit()?;
            Ok(Vec::new())
        }
        OP_ROLLBACK => {
            session.rollback()?;
            Ok(Vec::new())
        }
        other => Err(SheafError::Protocol(format!("unknown opcode {other}"))),
    }
}

fn encode_optional(out: &mut Vec<u8>, value: Option<Vec<u8>>) {
    match value {
        Some(bytes) => {
            write_u8(out, 1);
            write_bytes(out, &bytes);
        }
        None => write_u8(out, 0),
    }
}

/// Minimal blocking client for the frame protocol; test and tooling use.
pub mod client {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    use byteorder::{ByteOrder, LittleEndian};

    use crate::btree::types::{write_bytes, write_u8, ByteReader};
    use crate::core::errors::SheafError;
    use crate::core::Result;

    pub struct SheafClient {
        stream: TcpStream,
    }

    impl SheafClient {
        pub fn connect(addr: &str) -> Result<Self> {
            let stream = TcpStream::connect(addr).map_err(SheafError::Io)?;
            Ok(Self { stream })
        }

        fn call(&mut self, opcode: u8, payload: &[u8]) -> Result<Vec<u8>> {
            let mut frame = Vec::with_capacity(payload.len() + 5);
            let mut len_prefix = [0u8; 4];
            LittleEndian::write_u32(&mut len_prefix, (payload.len() + 1) as u32);
            frame.extend_from_slice(&len_prefix);
            write_u8(&mut frame, opcode);
            frame.extend_from_slice(payload);
            self.stream.write_all(&frame).map_err(SheafError::Io)?;

            let mut len_buf = [0u8; 4];
            self.stream.read_exact(&mut len_buf).map_err(SheafError::Io)?;
            let len = LittleEndian::read_u32(&len_buf) as usize;
            let mut response = vec![0u8; len];
            self.stream
                .read_exact(&mut response)
                .map_err(SheafError::Io)?;

            let mut reader = ByteReader::new(&response);
            let status = reader.read_u8()?;
            if status != super::STATUS_OK {
                let message = reader.read_string()?;
                return Err(SheafError::Protocol(message));
            }
            Ok(response[1..].to_vec())
        }

        pub fn open_session(&mut self) -> Result<u64> {
            let body = self.call(super::OP_OPEN_SESSION, &[])?;
            let mut reader = ByteReader::new(&body);
            reader.read_u64()
        }

        pub fn put(&mut self, map: &str, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
            let mut payload = Vec::new();
            write_bytes(&mut payload, map.as_bytes());
            write_bytes(&mut payload, key);
            write_bytes(&mut payload, value);
            let body = self.call(super::OP_PUT, &payload)?;
            decode_optional(&body)
        }

        pub fn get(&mut self, map: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
            let mut payload = Vec::new();
            write_bytes(&mut payload, map.as_bytes());
            write_bytes(&mut payload, key);
            let body = self.call(super::OP_GET, &payload)?;
            decode_optional(&body)
        }

        pub fn remove(&mut self, map: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
            let mut payload = Vec::new();
            write_bytes(&mut payload, map.as_bytes());
            write_bytes(&mut payload, key);
            let body = self.call(super::OP_REMOVE, &payload)?;
            decode_optional(&body)
        }

        pub fn commit(&mut self) -> Result<()> {
            self.call(super::OP_COMMIT, &[])?;
            Ok(())
        }

        pub fn rollback(&mut self) -> Result<()> {
            self.call(super::OP_ROLLBACK, &[])?;
            Ok(())
        }
    }

    fn decode_optional(body: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut reader = ByteReader::new(body);
        if reader.read_u8()? == 1 {
            Ok(Some(reader.read_bytes()?))
        } else {
            Ok(None)
        }
    }
}
