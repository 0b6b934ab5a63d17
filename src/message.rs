use std::io;

use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::Result;

pub type NodeId = u32;
pub type TxId = Uuid;

/// Upper bound on a single frame. Both RPC messages and WAL records are tiny;
/// anything larger is a garbage length prefix, not a real payload.
const MAX_FRAME_LEN: u32 = 16 * 1024;

/// Outcome of a transaction as recorded in the write-ahead log.
///
/// The discriminants are part of the wire and disk format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionState {
    Prepared = 1,
    Committed = 2,
    Aborted = 3,
}

impl Serialize for TransactionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for TransactionState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(TransactionState::Prepared),
            2 => Ok(TransactionState::Committed),
            3 => Ok(TransactionState::Aborted),
            code => Err(de::Error::custom(format!(
                "invalid transaction state code {code}"
            ))),
        }
    }
}

/// One durable record in a node's write-ahead log.
///
/// `sender_id` names the coordinator of the transaction so a recovering
/// participant knows whom to ask about an undecided prepare. `value` is
/// meaningful for `Prepared` and `Committed` records only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub tx_id: TxId,
    pub state: TransactionState,
    pub sender_id: NodeId,
    pub value: i64,
}

/// Payload carried by the transaction RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestArgs {
    pub tx_id: TxId,
    pub value: i64,
    pub sender_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Prepare(RequestArgs),
    Commit(RequestArgs),
    Abort(RequestArgs),
    GetStatus { tx_id: TxId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Participant verdict for `Prepare`/`Commit`/`Abort`.
    Vote(bool),
    /// Reply to `GetStatus`; absence of a commit record reads as `Aborted`.
    Status(TransactionState),
}

/// Writes one length-prefixed bincode frame and flushes it.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = bincode::serialize(message)?;
    let len = encoded.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed bincode frame.
///
/// Returns `Ok(None)` on a clean end of stream, i.e. EOF exactly at a frame
/// boundary. A short read inside a frame or an undecodable payload is an
/// error; on the WAL path callers treat that as tail corruption.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds cap {MAX_FRAME_LEN}"),
        )
        .into());
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(bincode::deserialize(&buf)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_request_frame() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        let message = Request::Prepare(RequestArgs {
            tx_id: Uuid::new_v4(),
            value: 42,
            sender_id: 7,
        });

        write_frame(&mut writer, &message).await.expect("write");
        let parsed = read_frame::<_, Request>(&mut reader)
            .await
            .expect("read")
            .expect("expected frame");

        assert_eq!(message, parsed);
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let (writer, mut reader) = tokio::io::duplex(64);
        drop(writer);

        let parsed = read_frame::<_, Response>(&mut reader).await.expect("read");
        assert!(parsed.is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        // Length prefix promises 8 bytes but only 2 arrive before EOF.
        writer.write_all(&8u32.to_be_bytes()).await.unwrap();
        writer.write_all(&[1, 2]).await.unwrap();
        drop(writer);

        assert!(read_frame::<_, Response>(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        drop(writer);

        assert!(read_frame::<_, Response>(&mut reader).await.is_err());
    }

    #[test]
    fn transaction_state_codes_are_wire_stable() {
        assert_eq!(
            bincode::serialize(&TransactionState::Prepared).unwrap(),
            [1]
        );
        assert_eq!(
            bincode::serialize(&TransactionState::Committed).unwrap(),
            [2]
        );
        assert_eq!(bincode::serialize(&TransactionState::Aborted).unwrap(), [3]);
        assert!(bincode::deserialize::<TransactionState>(&[4]).is_err());
    }
}
