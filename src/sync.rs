use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::channel::{Channel, CLOSE_FAILED, CLOSE_OK};
use super::protocol::AdbError;

/// Largest DATA payload the device sends or accepts
pub const SYNC_DATA_MAX: usize = 64 * 1024;

/// Size of the stat block that follows a DENT opcode
pub const DENT_STAT_SIZE: usize = 16;

/// Longest entry name accepted in a DENT reply
pub const SYNC_NAME_MAX: usize = 1024;

/// Sync protocol commands (for file operations)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyncCommand {
    /// List directory
    List = 0x5453494c, // "LIST"
    /// Send file to device
    Send = 0x444e4553, // "SEND"
    /// Receive file from device
    Recv = 0x56434552, // "RECV"
    /// Data packet
    Data = 0x41544144, // "DATA"
    /// Done/Success
    Done = 0x454e4f44, // "DONE"
    /// Fail/Error
    Fail = 0x4c494146, // "FAIL"
    /// Directory entry
    Dent = 0x544e4544, // "DENT"
    /// Send accepted
    Okay = 0x59414b4f, // "OKAY"
    /// End the sync session
    Quit = 0x54495551, // "QUIT"
}

impl SyncCommand {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x5453494c => Some(SyncCommand::List),
            0x444e4553 => Some(SyncCommand::Send),
            0x56434552 => Some(SyncCommand::Recv),
            0x41544144 => Some(SyncCommand::Data),
            0x454e4f44 => Some(SyncCommand::Done),
            0x4c494146 => Some(SyncCommand::Fail),
            0x544e4544 => Some(SyncCommand::Dent),
            0x59414b4f => Some(SyncCommand::Okay),
            0x54495551 => Some(SyncCommand::Quit),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> [u8; 4] {
        (*self as u32).to_le_bytes()
    }
}

/// Sync request: opcode, little-endian length, argument bytes
pub struct SyncPacket {
    pub command: SyncCommand,
    pub data: Vec<u8>,
}

impl SyncPacket {
    /// Create a new sync packet
    pub fn new(command: SyncCommand, data: Vec<u8>) -> Self {
        Self { command, data }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.data.len());
        bytes.extend_from_slice(&self.command.as_bytes());
        bytes.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

/// File statistics carried in a DENT stat block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

impl FileStat {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdbError> {
        if bytes.len() < 12 {
            return Err(AdbError::InvalidMessage("File stat too short".to_string()));
        }

        Ok(Self {
            mode: le_u32(&bytes[0..4]),
            size: le_u32(&bytes[4..8]),
            mtime: le_u32(&bytes[8..12]),
        })
    }

    pub fn is_directory(&self) -> bool {
        (self.mode & 0o170000) == 0o040000
    }

    pub fn is_file(&self) -> bool {
        (self.mode & 0o170000) == 0o100000
    }
}

/// Directory entry from LIST/DENT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

impl DirEntry {
    /// Decode a forwarded `DENT ‖ stat ‖ name` frame.
    pub fn from_frame(frame: &[u8]) -> Result<Self, AdbError> {
        if frame.len() < 4 + DENT_STAT_SIZE || frame[0..4] != SyncCommand::Dent.as_bytes() {
            return Err(AdbError::InvalidMessage("Not a DENT frame".to_string()));
        }
        let stat_block = &frame[4..4 + DENT_STAT_SIZE];
        let name_length = le_u32(&stat_block[12..16]) as usize;
        let name = frame
            .get(4 + DENT_STAT_SIZE..4 + DENT_STAT_SIZE + name_length)
            .ok_or_else(|| AdbError::InvalidMessage("DENT name truncated".to_string()))?;

        Ok(Self {
            name: String::from_utf8_lossy(name).into_owned(),
            stat: FileStat::from_bytes(stat_block)?,
        })
    }

    pub fn is_directory(&self) -> bool {
        self.stat.is_directory()
    }

    pub fn is_file(&self) -> bool {
        self.stat.is_file()
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

async fn read_u32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32, AdbError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).await?;
    Ok(u32::from_le_bytes(bytes))
}

/// Read the next reply opcode. Unknown opcodes are a framing violation.
pub async fn read_command<R: AsyncRead + Unpin>(reader: &mut R) -> Result<SyncCommand, AdbError> {
    let raw = read_u32(reader).await?;
    SyncCommand::from_u32(raw).ok_or_else(|| {
        AdbError::ProtocolFraming(format!(
            "Unexpected sync reply: {:?}",
            String::from_utf8_lossy(&raw.to_le_bytes())
        ))
    })
}

/// Read the message that follows a FAIL opcode.
async fn read_fail_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, AdbError> {
    let length = read_u32(reader).await? as usize;
    if length > SYNC_DATA_MAX {
        return Err(AdbError::ProtocolFraming(format!(
            "FAIL message of {} bytes exceeds {}",
            length, SYNC_DATA_MAX
        )));
    }
    let mut message = vec![0u8; length];
    reader.read_exact(&mut message).await?;
    Ok(String::from_utf8_lossy(&message).into_owned())
}

async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    command: SyncCommand,
    argument: &str,
) -> Result<(), AdbError> {
    let packet = SyncPacket::new(command, argument.as_bytes().to_vec());
    writer.write_all(&packet.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Stream a directory listing into `sink`, one raw DENT frame per entry.
pub async fn pipe_read_dir<S>(stream: &mut S, path: &str, sink: &dyn Channel) -> Result<(), AdbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = read_dir_frames(stream, path, sink).await;
    finish_pipe(stream, "LIST", path, result, sink).await
}

async fn read_dir_frames<S>(stream: &mut S, path: &str, sink: &dyn Channel) -> Result<(), AdbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_request(stream, SyncCommand::List, path).await?;

    loop {
        match read_command(stream).await? {
            SyncCommand::Dent => {
                let mut stat = [0u8; DENT_STAT_SIZE];
                stream.read_exact(&mut stat).await?;
                let name_length = le_u32(&stat[12..16]) as usize;
                if name_length > SYNC_NAME_MAX {
                    return Err(AdbError::ProtocolFraming(format!(
                        "DENT name of {} bytes exceeds {}",
                        name_length, SYNC_NAME_MAX
                    )));
                }
                let mut frame = BytesMut::with_capacity(4 + DENT_STAT_SIZE + name_length);
                frame.put_slice(&SyncCommand::Dent.as_bytes());
                frame.put_slice(&stat);
                frame.resize(4 + DENT_STAT_SIZE + name_length, 0);
                stream.read_exact(&mut frame[4 + DENT_STAT_SIZE..]).await?;
                sink.send(frame.freeze());
            }
            SyncCommand::Done => {
                let mut trailer = [0u8; DENT_STAT_SIZE];
                stream.read_exact(&mut trailer).await?;
                return Ok(());
            }
            SyncCommand::Fail => {
                return Err(AdbError::Transfer(read_fail_message(stream).await?));
            }
            other => {
                return Err(AdbError::ProtocolFraming(format!(
                    "Unexpected {:?} while listing",
                    other
                )))
            }
        }
    }
}

/// Stream a file's DATA frames into `sink`.
pub async fn pipe_pull<S>(stream: &mut S, path: &str, sink: &dyn Channel) -> Result<(), AdbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = read_data_frames(stream, path, sink).await;
    finish_pipe(stream, "RECV", path, result, sink).await
}

async fn read_data_frames<S>(stream: &mut S, path: &str, sink: &dyn Channel) -> Result<(), AdbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_request(stream, SyncCommand::Recv, path).await?;

    loop {
        match read_command(stream).await? {
            SyncCommand::Data => {
                let length = read_u32(stream).await? as usize;
                if length > SYNC_DATA_MAX {
                    return Err(AdbError::ProtocolFraming(format!(
                        "DATA chunk of {} bytes exceeds {}",
                        length, SYNC_DATA_MAX
                    )));
                }
                let mut frame = BytesMut::with_capacity(4 + length);
                frame.put_slice(&SyncCommand::Data.as_bytes());
                frame.resize(4 + length, 0);
                stream.read_exact(&mut frame[4..]).await?;
                sink.send(frame.freeze());
            }
            SyncCommand::Done => {
                let _ = read_u32(stream).await?;
                return Ok(());
            }
            SyncCommand::Fail => {
                return Err(AdbError::Transfer(read_fail_message(stream).await?));
            }
            other => {
                return Err(AdbError::ProtocolFraming(format!(
                    "Unexpected {:?} while pulling",
                    other
                )))
            }
        }
    }
}

/// Close the sink according to `result` and end the sync connection.
async fn finish_pipe<S>(
    stream: &mut S,
    operation: &str,
    path: &str,
    result: Result<(), AdbError>,
    sink: &dyn Channel,
) -> Result<(), AdbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match &result {
        Ok(()) => sink.close(CLOSE_OK, None),
        Err(AdbError::Transfer(message)) => {
            log::debug!("{} {} failed on device: {}", operation, path, message);
            sink.close(CLOSE_FAILED, Some(message));
        }
        Err(e) => {
            log::warn!("{} {} aborted: {}", operation, path, e);
            sink.close(CLOSE_FAILED, Some(&e.to_string()));
        }
    }
    end_connection(stream).await;
    result
}

/// Best-effort QUIT followed by shutdown of our write half.
pub async fn end_connection<S: AsyncWrite + Unpin>(stream: &mut S) {
    let quit = SyncPacket::new(SyncCommand::Quit, Vec::new()).to_bytes();
    if stream.write_all(&quit).await.is_ok() {
        let _ = stream.shutdown().await;
    }
}

/// Send `source` to `remote_path` with SEND/DATA/DONE. Returns bytes sent.
pub async fn send<S, R>(
    stream: &mut S,
    source: &mut R,
    remote_path: &str,
    mode: u32,
    mtime: u32,
) -> Result<u64, AdbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    write_request(stream, SyncCommand::Send, &format!("{},{}", remote_path, mode)).await?;

    let mut buf = vec![0u8; SYNC_DATA_MAX];
    let mut total = 0u64;
    loop {
        let len = source.read(&mut buf).await?;
        if len == 0 {
            break;
        }
        stream.write_all(&SyncCommand::Data.as_bytes()).await?;
        stream.write_all(&(len as u32).to_le_bytes()).await?;
        stream.write_all(&buf[..len]).await?;
        total += len as u64;
    }

    // DONE carries the modification time in its length field
    stream.write_all(&SyncCommand::Done.as_bytes()).await?;
    stream.write_all(&mtime.to_le_bytes()).await?;
    stream.flush().await?;

    match read_command(stream).await? {
        SyncCommand::Okay => {
            let _ = read_u32(stream).await?;
            Ok(total)
        }
        SyncCommand::Fail => Err(AdbError::Transfer(read_fail_message(stream).await?)),
        other => Err(AdbError::ProtocolFraming(format!(
            "Unexpected {:?} after DONE",
            other
        ))),
    }
}
