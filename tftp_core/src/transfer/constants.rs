use std::time::Duration;

/// Well-known port the dispatcher listens on
pub const TFTP_PORT: u16 = 69;

/// Largest payload carried by a single DATA packet
pub const MAX_DATA_SIZE: usize = 512;

/// Opcode plus block number (DATA/ACK) or error code (ERROR)
pub const HEADER_SIZE: usize = 4;

/// DATA header plus a full payload
pub const MAX_PACKET_SIZE: usize = MAX_DATA_SIZE + HEADER_SIZE;

/// Smallest buffer that can hold an ERROR packet (header plus NUL)
pub const MIN_ERROR_PACKET_SIZE: usize = HEADER_SIZE + 1;

/// Receive buffer size; anything longer than a DATA packet is truncated and rejected
pub const RECV_BUFFER_SIZE: usize = 1024;

/// ACK block number that confirms a delete instead of acknowledging data
pub const DELETE_ACK_BLOCK: u16 = 0xFFFF;

/// The only transfer mode served
pub const OCTET_MODE: &str = "octet";

/// Registered-port range used for ephemeral transfer sockets
pub const MIN_EPHEMERAL_PORT: u16 = 1024;
pub const MAX_EPHEMERAL_PORT: u16 = 65535;

/// Random ports tried before giving up on an ephemeral bind
pub const EPHEMERAL_BIND_TRIES: usize = 3;

/// Timeouts absorbed inside a single receive call
pub const RECV_TRIES: u32 = 3;

/// Consecutive invalid or missing responses tolerated by a session
pub const MAX_RETRIES: u32 = 3;

/// Per-attempt receive timeout
pub const RECV_TIMEOUT: Duration = Duration::from_millis(1800);

/// Longest file name accepted by the file store
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Default cap on concurrently running server sessions
pub const MAX_SESSIONS: usize = 64;

/// Suffix of the temporary file holding compressed bytes
pub const COMPRESSED_SUFFIX: &str = ".cmp";
