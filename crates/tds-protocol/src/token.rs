//! TDS token stream definitions.
//!
//! Tokens are the fundamental units of TDS response data. The server sends
//! a stream of tokens that describe metadata, rows, errors, and other information.
//!
//! ## Token Structure
//!
//! Each token begins with a 1-byte token type identifier, followed by
//! token-specific data. Some tokens have fixed lengths, while others
//! have length prefixes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tds_protocol::token::{Token, TokenParser};
//! use bytes::Bytes;
//!
//! let data: Bytes = /* received from server */;
//! let mut parser = TokenParser::new(data);
//!
//! while let Some(token) = parser.next_token()? {
//!     match token {
//!         Token::Done(done) => println!("Rows affected: {}", done.row_count),
//!         Token::Error(err) => eprintln!("Error {}: {}", err.number, err.message),
//!         _ => {}
//!     }
//! }
//! ```

use bytes::{Buf, BufMut, Bytes};

use crate::codec::{read_b_varchar, read_us_varchar};
use crate::error::ProtocolError;
use crate::types::TypeId;
use crate::version::TdsVersion;

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Column metadata (COLMETADATA).
    ColMetaData = 0x81,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Row data (ROW).
    Row = 0xD1,
    /// Null bitmap compressed row (NBCROW).
    NbcRow = 0xD2,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// SSPI authentication (SSPI).
    Sspi = 0xED,
    /// Done (DONE).
    Done = 0xFD,
    /// Done in procedure (DONEINPROC).
    DoneInProc = 0xFF,
    /// Done procedure (DONEPROC).
    DoneProc = 0xFE,
    /// Return status (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Return value (RETURNVALUE).
    ReturnValue = 0xAC,
    /// Order (ORDER).
    Order = 0xA9,
    /// Feature extension acknowledgment (FEATUREEXTACK).
    FeatureExtAck = 0xAE,
    /// Session state (SESSIONSTATE).
    SessionState = 0xE4,
    /// Federated authentication info (FEDAUTHINFO).
    FedAuthInfo = 0xEE,
    /// Column info (COLINFO).
    ColInfo = 0xA5,
    /// Table name (TABNAME).
    TabName = 0xA4,
    /// Offset (OFFSET).
    Offset = 0x78,
}

impl TokenType {
    /// Create a token type from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x81 => Some(Self::ColMetaData),
            0xAA => Some(Self::Error),
            0xAB => Some(Self::Info),
            0xAD => Some(Self::LoginAck),
            0xD1 => Some(Self::Row),
            0xD2 => Some(Self::NbcRow),
            0xE3 => Some(Self::EnvChange),
            0xED => Some(Self::Sspi),
            0xFD => Some(Self::Done),
            0xFF => Some(Self::DoneInProc),
            0xFE => Some(Self::DoneProc),
            0x79 => Some(Self::ReturnStatus),
            0xAC => Some(Self::ReturnValue),
            0xA9 => Some(Self::Order),
            0xAE => Some(Self::FeatureExtAck),
            0xE4 => Some(Self::SessionState),
            0xEE => Some(Self::FedAuthInfo),
            0xA5 => Some(Self::ColInfo),
            0xA4 => Some(Self::TabName),
            0x78 => Some(Self::Offset),
            _ => None,
        }
    }
}

/// Parsed TDS token.
///
/// This enum represents all possible tokens that can be received from SQL Server.
/// Each variant contains the parsed token data.
#[derive(Debug, Clone)]
pub enum Token {
    /// Column metadata describing result set structure.
    ColMetaData(ColMetaData),
    /// Row data.
    Row(RawRow),
    /// Null bitmap compressed row.
    NbcRow(NbcRow),
    /// Completion of a SQL statement.
    Done(Done),
    /// Completion of a stored procedure.
    DoneProc(DoneProc),
    /// Completion within a stored procedure.
    DoneInProc(DoneInProc),
    /// Return status from stored procedure.
    ReturnStatus(i32),
    /// Return value from stored procedure.
    ReturnValue(ReturnValue),
    /// Error message from server.
    Error(ServerError),
    /// Informational message from server.
    Info(ServerInfo),
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// Environment change notification.
    EnvChange(EnvChange),
    /// Column ordering information.
    Order(Order),
    /// Feature extension acknowledgment.
    FeatureExtAck(FeatureExtAck),
    /// SSPI authentication data.
    Sspi(SspiToken),
    /// Session state information.
    SessionState(SessionState),
    /// Federated authentication info.
    FedAuthInfo(FedAuthInfo),
}

/// Column metadata token.
#[derive(Debug, Clone, Default)]
pub struct ColMetaData {
    /// Column definitions.
    pub columns: Vec<ColumnData>,
}

/// Column definition within metadata.
#[derive(Debug, Clone)]
pub struct ColumnData {
    /// Column name.
    pub name: String,
    /// Column data type.
    pub col_type: u8,
    /// Resolved type identifier for `col_type`.
    pub type_id: TypeId,
    /// Server user-defined type ID (0 for built-in types).
    pub user_type: u32,
    /// Column flags.
    pub flags: u16,
    /// Type-specific metadata.
    pub type_info: TypeInfo,
}

/// Type-specific metadata.
#[derive(Debug, Clone, Default)]
pub struct TypeInfo {
    /// Maximum length for variable-length types.
    pub max_length: Option<u32>,
    /// Precision for numeric types.
    pub precision: Option<u8>,
    /// Scale for numeric types.
    pub scale: Option<u8>,
    /// Collation for string types.
    pub collation: Option<Collation>,
}

/// SQL Server collation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Collation {
    /// Locale ID.
    pub lcid: u32,
    /// Sort ID.
    pub sort_id: u8,
}

/// Raw row data (not yet decoded).
#[derive(Debug, Clone)]
pub struct RawRow {
    /// Raw column values, concatenated in column order.
    pub data: bytes::Bytes,
}

/// Null bitmap compressed row.
#[derive(Debug, Clone)]
pub struct NbcRow {
    /// Null bitmap, one bit per column (bit set = null).
    pub null_bitmap: Vec<u8>,
    /// Raw non-null column values, concatenated in column order.
    pub data: bytes::Bytes,
}

impl NbcRow {
    /// Check whether the column at `index` is null according to the bitmap.
    #[must_use]
    pub fn is_null(&self, index: usize) -> bool {
        let byte = index / 8;
        let bit = index % 8;
        self.null_bitmap
            .get(byte)
            .is_some_and(|b| b & (1 << bit) != 0)
    }
}

impl Collation {
    /// Decode a 5-byte `COLLATION` struct.
    ///
    /// Layout: 3 bytes LCID + sort flags (little-endian, 20 bits LCID / 12
    /// bits comparison flags), 1 byte sort ID.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 5 {
            return Err(ProtocolError::IncompletePacket {
                expected: 5,
                actual: src.remaining(),
            });
        }
        let b0 = src.get_u8() as u32;
        let b1 = src.get_u8() as u32;
        let b2 = src.get_u8() as u32;
        let _b3 = src.get_u8(); // comparison flags (high nibble) + version
        let sort_id = src.get_u8();
        let lcid = b0 | (b1 << 8) | ((b2 & 0x0F) << 16);
        Ok(Self { lcid, sort_id })
    }
}

impl TypeInfo {
    /// Decode the `TYPE_INFO` structure that follows a type ID byte in
    /// COLMETADATA, RETURNVALUE, and similar tokens.
    ///
    /// Which additional bytes follow depends entirely on `type_id`; fixed
    /// types carry none.
    pub fn decode(src: &mut impl Buf, type_id: TypeId) -> Result<Self, ProtocolError> {
        let mut info = TypeInfo::default();

        match type_id {
            // Fixed-length: no TYPE_INFO bytes beyond the type ID itself.
            TypeId::Null
            | TypeId::Int1
            | TypeId::Bit
            | TypeId::Int2
            | TypeId::Int4
            | TypeId::Int8
            | TypeId::Float4
            | TypeId::Float8
            | TypeId::Money
            | TypeId::Money4
            | TypeId::DateTime
            | TypeId::DateTime4
            | TypeId::Date => {}

            // 1-byte max length, no collation.
            TypeId::IntN
            | TypeId::FloatN
            | TypeId::BitN
            | TypeId::MoneyN
            | TypeId::DateTimeN
            | TypeId::Guid => {
                require(src, 1)?;
                info.max_length = Some(src.get_u8() as u32);
            }

            // 1-byte max length + precision + scale.
            TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
                require(src, 3)?;
                info.max_length = Some(src.get_u8() as u32);
                info.precision = Some(src.get_u8());
                info.scale = Some(src.get_u8());
            }

            // 1-byte scale only.
            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
                require(src, 1)?;
                info.scale = Some(src.get_u8());
            }

            // Legacy byte-counted types: 1-byte max length, + collation for char types.
            TypeId::Char | TypeId::VarChar => {
                require(src, 1)?;
                info.max_length = Some(src.get_u8() as u32);
                info.collation = Some(Collation::decode(src)?);
            }
            TypeId::Binary | TypeId::VarBinary => {
                require(src, 1)?;
                info.max_length = Some(src.get_u8() as u32);
            }

            // Big/Unicode types: 2-byte max length, + collation for char types.
            TypeId::BigVarChar | TypeId::BigChar | TypeId::NVarChar | TypeId::NChar => {
                require(src, 2)?;
                info.max_length = Some(src.get_u16_le() as u32);
                info.collation = Some(Collation::decode(src)?);
            }
            TypeId::BigVarBinary | TypeId::BigBinary => {
                require(src, 2)?;
                info.max_length = Some(src.get_u16_le() as u32);
            }

            // Deprecated LOB types: 4-byte max length, + collation for text/ntext,
            // followed by a table name (sequence of b_varchar parts) we don't need.
            TypeId::Text | TypeId::NText => {
                require(src, 4)?;
                info.max_length = Some(src.get_u32_le());
                info.collation = Some(Collation::decode(src)?);
                skip_table_name(src)?;
            }
            TypeId::Image => {
                require(src, 4)?;
                info.max_length = Some(src.get_u32_le());
                skip_table_name(src)?;
            }

            // XML: 1-byte schema-present flag, optionally followed by schema info.
            TypeId::Xml => {
                require(src, 1)?;
                let has_schema = src.get_u8();
                if has_schema != 0 {
                    let _db = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
                    let _owner = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
                    let _collection = read_us_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
                }
            }

            // UDT / TVP: treat the max length as opaque, skip the descriptive names.
            TypeId::Udt => {
                require(src, 2)?;
                info.max_length = Some(src.get_u16_le() as u32);
                let _db = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
                let _schema = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
                let _type_name = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
                let _assembly = read_us_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
            }
            TypeId::Tvp => {
                let _db = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
                let _schema = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
                let _type_name = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
            }

            // SQL_VARIANT carries no static TYPE_INFO; its shape is embedded per-value.
            TypeId::Variant => {}
        }

        Ok(info)
    }
}

fn require(src: &impl Buf, n: usize) -> Result<(), ProtocolError> {
    if src.remaining() < n {
        return Err(ProtocolError::IncompletePacket {
            expected: n,
            actual: src.remaining(),
        });
    }
    Ok(())
}

fn skip_table_name(src: &mut impl Buf) -> Result<(), ProtocolError> {
    require(src, 2)?;
    let num_parts = src.get_u16_le();
    for _ in 0..num_parts {
        let _part = read_us_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
    }
    Ok(())
}

impl ColumnData {
    /// Decode one column descriptor from a COLMETADATA token.
    ///
    /// `user_type` is 4 bytes on TDS 7.2+ and 2 bytes on earlier versions.
    pub fn decode(src: &mut impl Buf, version: TdsVersion) -> Result<Self, ProtocolError> {
        let user_type = if version.supports_wide_done_rowcount() {
            require(src, 4)?;
            src.get_u32_le()
        } else {
            require(src, 2)?;
            src.get_u16_le() as u32
        };

        require(src, 2)?;
        let flags = src.get_u16_le();

        require(src, 1)?;
        let col_type = src.get_u8();
        let type_id =
            TypeId::from_u8(col_type).ok_or(ProtocolError::InvalidTokenType(col_type))?;

        let type_info = TypeInfo::decode(src, type_id)?;

        let name = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;

        Ok(Self {
            name,
            col_type,
            type_id,
            user_type,
            flags,
            type_info,
        })
    }

    /// Number of data bytes that `skip_value`/row decoding should consume for
    /// a non-null value of this column, or `None` when the length must be
    /// read from the wire (variable-length types).
    fn fixed_value_len(&self) -> Option<usize> {
        self.type_id.fixed_size()
    }
}

/// Skip over one column's raw value bytes, per the length-prefix convention
/// for its type, returning the number of bytes consumed (including any
/// length prefix but excluding the NBCROW null bitmap, which the caller
/// handles separately).
fn skip_column_value(src: &mut impl Buf, col: &ColumnData) -> Result<(), ProtocolError> {
    use TypeId::*;

    if let Some(len) = col.fixed_value_len() {
        require(src, len)?;
        src.advance(len);
        return Ok(());
    }

    match col.type_id {
        IntN | FloatN | BitN | MoneyN | Decimal | Numeric | DecimalN | NumericN | DateTimeN
        | Date | Time | DateTime2 | DateTimeOffset | Guid => {
            require(src, 1)?;
            let len = src.get_u8() as usize;
            if len > 0 {
                require(src, len)?;
                src.advance(len);
            }
        }
        Char | VarChar | Binary | VarBinary => {
            require(src, 1)?;
            let len = src.get_u8();
            if len != 0xFF {
                require(src, len as usize)?;
                src.advance(len as usize);
            }
        }
        BigVarChar | BigChar | NVarChar | NChar | BigVarBinary | BigBinary => {
            if col.type_info.max_length == Some(0xFFFF) {
                skip_plp(src)?;
            } else {
                require(src, 2)?;
                let len = src.get_u16_le();
                if len != 0xFFFF {
                    require(src, len as usize)?;
                    src.advance(len as usize);
                }
            }
        }
        Text | Image | NText | Xml | Udt => skip_plp(src)?,
        Variant => {
            require(src, 4)?;
            let total_len = src.get_u32_le() as usize;
            require(src, total_len)?;
            src.advance(total_len);
        }
        _ => {
            require(src, 2)?;
            let len = src.get_u16_le();
            if len != 0xFFFF {
                require(src, len as usize)?;
                src.advance(len as usize);
            }
        }
    }

    Ok(())
}

fn skip_plp(src: &mut impl Buf) -> Result<(), ProtocolError> {
    require(src, 8)?;
    let total_len = src.get_u64_le();
    if total_len == u64::MAX {
        return Ok(());
    }
    loop {
        require(src, 4)?;
        let chunk_len = src.get_u32_le() as usize;
        if chunk_len == 0 {
            break;
        }
        require(src, chunk_len)?;
        src.advance(chunk_len);
    }
    Ok(())
}

impl ColMetaData {
    /// Decode a COLMETADATA token body (column count through the final
    /// column name).
    pub fn decode(src: &mut impl Buf, version: TdsVersion) -> Result<Self, ProtocolError> {
        require(src, 2)?;
        let count = src.get_u16_le();

        // 0xFFFF signals "no metadata" (used by some NOCOUNT responses).
        if count == 0xFFFF {
            return Ok(Self {
                columns: Vec::new(),
            });
        }

        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            columns.push(ColumnData::decode(src, version)?);
        }

        Ok(Self { columns })
    }
}

impl RawRow {
    /// Decode a ROW token body using the preceding COLMETADATA for shape.
    ///
    /// Column values are never individually reinterpreted here; we only
    /// need to know how many bytes each one occupies so the row's raw
    /// bytes can be sliced out for later, value-level decoding.
    pub fn decode_with_metadata(
        src: &mut Bytes,
        metadata: &ColMetaData,
    ) -> Result<Self, ProtocolError> {
        let mut probe = src.clone();
        for col in &metadata.columns {
            skip_column_value(&mut probe, col)?;
        }
        let consumed = src.len() - probe.len();
        let data = src.split_to(consumed);
        Ok(Self { data })
    }
}

impl NbcRow {
    /// Decode an NBCROW token body: a null bitmap followed by the raw
    /// values of only the non-null columns.
    pub fn decode_with_metadata(
        src: &mut Bytes,
        metadata: &ColMetaData,
    ) -> Result<Self, ProtocolError> {
        let col_count = metadata.columns.len();
        let bitmap_len = (col_count + 7) / 8;
        require(src, bitmap_len)?;
        let null_bitmap = src.copy_to_bytes(bitmap_len).to_vec();

        let mut probe = src.clone();
        for (i, col) in metadata.columns.iter().enumerate() {
            let is_null = null_bitmap
                .get(i / 8)
                .is_some_and(|b| b & (1 << (i % 8)) != 0);
            if !is_null {
                skip_column_value(&mut probe, col)?;
            }
        }
        let consumed = src.len() - probe.len();
        let data = src.split_to(consumed);

        Ok(Self { null_bitmap, data })
    }
}

/// Done token indicating statement completion.
#[derive(Debug, Clone, Copy)]
pub struct Done {
    /// Status flags.
    pub status: DoneStatus,
    /// Current command.
    pub cur_cmd: u16,
    /// Row count (if applicable).
    pub row_count: u64,
}

/// Done status flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoneStatus {
    /// More results follow.
    pub more: bool,
    /// Error occurred.
    pub error: bool,
    /// Transaction in progress.
    pub in_xact: bool,
    /// Row count is valid.
    pub count: bool,
    /// Attention acknowledgment.
    pub attn: bool,
    /// Server error caused statement termination.
    pub srverror: bool,
}

/// Done in procedure token.
#[derive(Debug, Clone, Copy)]
pub struct DoneInProc {
    /// Status flags.
    pub status: DoneStatus,
    /// Current command.
    pub cur_cmd: u16,
    /// Row count.
    pub row_count: u64,
}

/// Done procedure token.
#[derive(Debug, Clone, Copy)]
pub struct DoneProc {
    /// Status flags.
    pub status: DoneStatus,
    /// Current command.
    pub cur_cmd: u16,
    /// Row count.
    pub row_count: u64,
}

/// Return value from stored procedure.
#[derive(Debug, Clone)]
pub struct ReturnValue {
    /// Parameter ordinal.
    pub param_ordinal: u16,
    /// Parameter name.
    pub param_name: String,
    /// Status flags.
    pub status: u8,
    /// User type.
    pub user_type: u32,
    /// Type flags.
    pub flags: u16,
    /// Type info.
    pub type_info: TypeInfo,
    /// Value data.
    pub value: bytes::Bytes,
}

impl ReturnValue {
    /// Decode a RETURNVALUE token body.
    pub fn decode(src: &mut Bytes, version: TdsVersion) -> Result<Self, ProtocolError> {
        require(src, 2)?;
        let param_ordinal = src.get_u16_le();
        let param_name = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;

        require(src, 1)?;
        let status = src.get_u8();

        let user_type = if version.supports_wide_done_rowcount() {
            require(src, 4)?;
            src.get_u32_le()
        } else {
            require(src, 2)?;
            src.get_u16_le() as u32
        };

        require(src, 2)?;
        let flags = src.get_u16_le();

        require(src, 1)?;
        let col_type = src.get_u8();
        let type_id =
            TypeId::from_u8(col_type).ok_or(ProtocolError::InvalidTokenType(col_type))?;
        let type_info = TypeInfo::decode(src, type_id)?;

        let shape = ColumnData {
            name: param_name.clone(),
            col_type,
            type_id,
            user_type,
            flags,
            type_info: type_info.clone(),
        };
        let mut probe = src.clone();
        skip_column_value(&mut probe, &shape)?;
        let consumed = src.len() - probe.len();
        let value = src.split_to(consumed);

        Ok(Self {
            param_ordinal,
            param_name,
            status,
            user_type,
            flags,
            type_info,
            value,
        })
    }
}

/// Server error message.
#[derive(Debug, Clone)]
pub struct ServerError {
    /// Error number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Error severity class.
    pub class: u8,
    /// Error message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: i32,
}

/// Server informational message.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Info number.
    pub number: i32,
    /// Info state.
    pub state: u8,
    /// Info class (severity).
    pub class: u8,
    /// Info message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: i32,
}

/// Login acknowledgment token.
#[derive(Debug, Clone)]
pub struct LoginAck {
    /// Interface type.
    pub interface: u8,
    /// TDS version.
    pub tds_version: u32,
    /// Program name.
    pub prog_name: String,
    /// Program version.
    pub prog_version: u32,
}

/// Environment change token.
#[derive(Debug, Clone)]
pub struct EnvChange {
    /// Type of environment change.
    pub env_type: EnvChangeType,
    /// New value.
    pub new_value: EnvChangeValue,
    /// Old value.
    pub old_value: EnvChangeValue,
}

/// Environment change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvChangeType {
    /// Database changed.
    Database = 1,
    /// Language changed.
    Language = 2,
    /// Character set changed.
    CharacterSet = 3,
    /// Packet size changed.
    PacketSize = 4,
    /// Unicode data sorting locale ID.
    UnicodeSortingLocalId = 5,
    /// Unicode comparison flags.
    UnicodeComparisonFlags = 6,
    /// SQL collation.
    SqlCollation = 7,
    /// Begin transaction.
    BeginTransaction = 8,
    /// Commit transaction.
    CommitTransaction = 9,
    /// Rollback transaction.
    RollbackTransaction = 10,
    /// Enlist DTC transaction.
    EnlistDtcTransaction = 11,
    /// Defect DTC transaction.
    DefectTransaction = 12,
    /// Real-time log shipping.
    RealTimeLogShipping = 13,
    /// Promote transaction.
    PromoteTransaction = 15,
    /// Transaction manager address.
    TransactionManagerAddress = 16,
    /// Transaction ended.
    TransactionEnded = 17,
    /// Reset connection completion acknowledgment.
    ResetConnectionCompletionAck = 18,
    /// User instance started.
    UserInstanceStarted = 19,
    /// Routing information.
    Routing = 20,
}

/// Environment change value.
#[derive(Debug, Clone)]
pub enum EnvChangeValue {
    /// String value.
    String(String),
    /// Binary value.
    Binary(bytes::Bytes),
    /// Routing information.
    Routing {
        /// Host name.
        host: String,
        /// Port number.
        port: u16,
    },
}

/// Column ordering information.
#[derive(Debug, Clone)]
pub struct Order {
    /// Ordered column indices.
    pub columns: Vec<u16>,
}

/// Feature extension acknowledgment.
#[derive(Debug, Clone)]
pub struct FeatureExtAck {
    /// Acknowledged features.
    pub features: Vec<FeatureAck>,
}

/// Individual feature acknowledgment.
#[derive(Debug, Clone)]
pub struct FeatureAck {
    /// Feature ID.
    pub feature_id: u8,
    /// Feature data.
    pub data: bytes::Bytes,
}

/// SSPI authentication token.
#[derive(Debug, Clone)]
pub struct SspiToken {
    /// SSPI data.
    pub data: bytes::Bytes,
}

/// Session state token.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Session state data.
    pub data: bytes::Bytes,
}

/// Federated authentication info.
#[derive(Debug, Clone)]
pub struct FedAuthInfo {
    /// STS URL.
    pub sts_url: String,
    /// Service principal name.
    pub spn: String,
}

// =============================================================================
// Token Parsing Implementation
// =============================================================================

/// Done token status flags bit positions.
mod done_status_bits {
    pub const DONE_MORE: u16 = 0x0001;
    pub const DONE_ERROR: u16 = 0x0002;
    pub const DONE_INXACT: u16 = 0x0004;
    pub const DONE_COUNT: u16 = 0x0010;
    pub const DONE_ATTN: u16 = 0x0020;
    pub const DONE_SRVERROR: u16 = 0x0100;
}

impl DoneStatus {
    /// Parse done status from raw bits.
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        use done_status_bits::*;
        Self {
            more: (bits & DONE_MORE) != 0,
            error: (bits & DONE_ERROR) != 0,
            in_xact: (bits & DONE_INXACT) != 0,
            count: (bits & DONE_COUNT) != 0,
            attn: (bits & DONE_ATTN) != 0,
            srverror: (bits & DONE_SRVERROR) != 0,
        }
    }

    /// Convert to raw bits.
    #[must_use]
    pub fn to_bits(&self) -> u16 {
        use done_status_bits::*;
        let mut bits = 0u16;
        if self.more {
            bits |= DONE_MORE;
        }
        if self.error {
            bits |= DONE_ERROR;
        }
        if self.in_xact {
            bits |= DONE_INXACT;
        }
        if self.count {
            bits |= DONE_COUNT;
        }
        if self.attn {
            bits |= DONE_ATTN;
        }
        if self.srverror {
            bits |= DONE_SRVERROR;
        }
        bits
    }
}

/// Size in bytes of a DONE-family token body (status + curcmd + rowcount)
/// for the given negotiated version, excluding the token type byte.
#[must_use]
fn done_body_size(version: TdsVersion) -> usize {
    if version.supports_wide_done_rowcount() {
        12 // 2 (status) + 2 (curcmd) + 8 (rowcount)
    } else {
        8 // 2 (status) + 2 (curcmd) + 4 (rowcount)
    }
}

fn decode_done_body(
    src: &mut impl Buf,
    version: TdsVersion,
) -> Result<(DoneStatus, u16, u64), ProtocolError> {
    let size = done_body_size(version);
    if src.remaining() < size {
        return Err(ProtocolError::IncompletePacket {
            expected: size,
            actual: src.remaining(),
        });
    }

    let status = DoneStatus::from_bits(src.get_u16_le());
    let cur_cmd = src.get_u16_le();
    let row_count = if version.supports_wide_done_rowcount() {
        src.get_u64_le()
    } else {
        u64::from(src.get_u32_le())
    };

    Ok((status, cur_cmd, row_count))
}

impl Done {
    /// Size of the DONE token body for TDS 7.2 and later (the common case).
    pub const SIZE: usize = 12;

    /// Decode a DONE token from bytes, given the negotiated TDS version.
    ///
    /// Row count is a 4-byte field before TDS 7.2 and an 8-byte field from
    /// 7.2 onward.
    pub fn decode(src: &mut impl Buf, version: TdsVersion) -> Result<Self, ProtocolError> {
        let (status, cur_cmd, row_count) = decode_done_body(src, version)?;
        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Encode the DONE token to bytes, always using the wide (7.2+) rowcount
    /// format.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::Done as u8);
        dst.put_u16_le(self.status.to_bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }

    /// Check if more results follow this DONE token.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.more
    }

    /// Check if an error occurred.
    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.status.error
    }

    /// Check if the row count is valid.
    #[must_use]
    pub const fn has_count(&self) -> bool {
        self.status.count
    }
}

impl DoneProc {
    /// Size of the DONEPROC token body for TDS 7.2 and later.
    pub const SIZE: usize = 12;

    /// Decode a DONEPROC token from bytes, given the negotiated TDS version.
    pub fn decode(src: &mut impl Buf, version: TdsVersion) -> Result<Self, ProtocolError> {
        let (status, cur_cmd, row_count) = decode_done_body(src, version)?;
        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Encode the DONEPROC token to bytes, always using the wide (7.2+)
    /// rowcount format.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::DoneProc as u8);
        dst.put_u16_le(self.status.to_bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }
}

impl DoneInProc {
    /// Size of the DONEINPROC token body for TDS 7.2 and later.
    pub const SIZE: usize = 12;

    /// Decode a DONEINPROC token from bytes, given the negotiated TDS version.
    pub fn decode(src: &mut impl Buf, version: TdsVersion) -> Result<Self, ProtocolError> {
        let (status, cur_cmd, row_count) = decode_done_body(src, version)?;
        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Encode the DONEINPROC token to bytes, always using the wide (7.2+)
    /// rowcount format.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::DoneInProc as u8);
        dst.put_u16_le(self.status.to_bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }
}

impl ServerError {
    /// Decode an ERROR token from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        // ERROR token: length (2) + number (4) + state (1) + class (1) +
        //              message (us_varchar) + server (b_varchar) + procedure (b_varchar) + line (4)
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let _length = src.get_u16_le();

        if src.remaining() < 6 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let number = src.get_i32_le();
        let state = src.get_u8();
        let class = src.get_u8();

        let message = read_us_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
        let server = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
        let procedure = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;

        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let line = src.get_i32_le();

        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Check if this is a fatal error (severity >= 20).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= 20
    }

    /// Check if this error indicates the batch was aborted (severity >= 16).
    #[must_use]
    pub const fn is_batch_abort(&self) -> bool {
        self.class >= 16
    }
}

impl ServerInfo {
    /// Decode an INFO token from bytes.
    ///
    /// INFO tokens have the same structure as ERROR tokens but with lower severity.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let _length = src.get_u16_le();

        if src.remaining() < 6 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let number = src.get_i32_le();
        let state = src.get_u8();
        let class = src.get_u8();

        let message = read_us_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
        let server = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;
        let procedure = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;

        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let line = src.get_i32_le();

        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }
}

impl LoginAck {
    /// Decode a LOGINACK token from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        // LOGINACK: length (2) + interface (1) + tds_version (4) + prog_name (b_varchar) + prog_version (4)
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let _length = src.get_u16_le();

        if src.remaining() < 5 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let interface = src.get_u8();
        let tds_version = src.get_u32_le();
        let prog_name = read_b_varchar(src).ok_or(ProtocolError::UnexpectedEof)?;

        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let prog_version = src.get_u32_le();

        Ok(Self {
            interface,
            tds_version,
            prog_name,
            prog_version,
        })
    }

    /// Get the TDS version as a `TdsVersion`.
    #[must_use]
    pub fn tds_version(&self) -> crate::version::TdsVersion {
        crate::version::TdsVersion::new(self.tds_version)
    }
}

impl EnvChangeType {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Database),
            2 => Some(Self::Language),
            3 => Some(Self::CharacterSet),
            4 => Some(Self::PacketSize),
            5 => Some(Self::UnicodeSortingLocalId),
            6 => Some(Self::UnicodeComparisonFlags),
            7 => Some(Self::SqlCollation),
            8 => Some(Self::BeginTransaction),
            9 => Some(Self::CommitTransaction),
            10 => Some(Self::RollbackTransaction),
            11 => Some(Self::EnlistDtcTransaction),
            12 => Some(Self::DefectTransaction),
            13 => Some(Self::RealTimeLogShipping),
            15 => Some(Self::PromoteTransaction),
            16 => Some(Self::TransactionManagerAddress),
            17 => Some(Self::TransactionEnded),
            18 => Some(Self::ResetConnectionCompletionAck),
            19 => Some(Self::UserInstanceStarted),
            20 => Some(Self::Routing),
            _ => None,
        }
    }
}

impl EnvChange {
    /// Decode an ENVCHANGE token from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 3 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let length = src.get_u16_le() as usize;
        if src.remaining() < length {
            return Err(ProtocolError::IncompletePacket {
                expected: length,
                actual: src.remaining(),
            });
        }

        let env_type_byte = src.get_u8();
        let env_type = EnvChangeType::from_u8(env_type_byte)
            .ok_or(ProtocolError::InvalidTokenType(env_type_byte))?;

        let (new_value, old_value) = match env_type {
            EnvChangeType::Routing => {
                // Routing has special format
                let new_value = Self::decode_routing_value(src)?;
                let old_value = EnvChangeValue::Binary(Bytes::new());
                (new_value, old_value)
            }
            EnvChangeType::SqlCollation
            | EnvChangeType::BeginTransaction
            | EnvChangeType::CommitTransaction
            | EnvChangeType::RollbackTransaction
            | EnvChangeType::EnlistDtcTransaction => {
                // Transaction tokens use binary format
                let new_len = src.get_u8() as usize;
                let new_value = if new_len > 0 && src.remaining() >= new_len {
                    EnvChangeValue::Binary(src.copy_to_bytes(new_len))
                } else {
                    EnvChangeValue::Binary(Bytes::new())
                };

                let old_len = src.get_u8() as usize;
                let old_value = if old_len > 0 && src.remaining() >= old_len {
                    EnvChangeValue::Binary(src.copy_to_bytes(old_len))
                } else {
                    EnvChangeValue::Binary(Bytes::new())
                };

                (new_value, old_value)
            }
            _ => {
                // String format for most env changes
                let new_value = read_b_varchar(src)
                    .map(EnvChangeValue::String)
                    .unwrap_or(EnvChangeValue::String(String::new()));

                let old_value = read_b_varchar(src)
                    .map(EnvChangeValue::String)
                    .unwrap_or(EnvChangeValue::String(String::new()));

                (new_value, old_value)
            }
        };

        Ok(Self {
            env_type,
            new_value,
            old_value,
        })
    }

    fn decode_routing_value(src: &mut impl Buf) -> Result<EnvChangeValue, ProtocolError> {
        // Routing format: length (2) + protocol (1) + port (2) + server_len (2) + server (utf16)
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let _routing_len = src.get_u16_le();

        if src.remaining() < 5 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let _protocol = src.get_u8();
        let port = src.get_u16_le();
        let server_len = src.get_u16_le() as usize;

        // Read UTF-16LE server name
        if src.remaining() < server_len * 2 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let mut chars = Vec::with_capacity(server_len);
        for _ in 0..server_len {
            chars.push(src.get_u16_le());
        }

        let host = String::from_utf16(&chars).map_err(|_| {
            ProtocolError::StringEncoding(
                #[cfg(feature = "std")]
                "invalid UTF-16 in routing hostname".to_string(),
                #[cfg(not(feature = "std"))]
                "invalid UTF-16 in routing hostname",
            )
        })?;

        Ok(EnvChangeValue::Routing { host, port })
    }

    /// Check if this is a routing redirect.
    #[must_use]
    pub fn is_routing(&self) -> bool {
        self.env_type == EnvChangeType::Routing
    }

    /// Get routing information if this is a routing change.
    #[must_use]
    pub fn routing_info(&self) -> Option<(&str, u16)> {
        if let EnvChangeValue::Routing { host, port } = &self.new_value {
            Some((host, *port))
        } else {
            None
        }
    }

    /// Get the new database name if this is a database change.
    #[must_use]
    pub fn new_database(&self) -> Option<&str> {
        if self.env_type == EnvChangeType::Database {
            if let EnvChangeValue::String(s) = &self.new_value {
                return Some(s);
            }
        }
        None
    }

    /// Decode the new value as a packet size, if this is a PACKETSIZE change.
    ///
    /// PACKETSIZE is carried as a decimal string on the wire.
    #[must_use]
    pub fn new_packet_size(&self) -> Option<u32> {
        if self.env_type == EnvChangeType::PacketSize {
            if let EnvChangeValue::String(s) = &self.new_value {
                return s.parse().ok();
            }
        }
        None
    }

    /// Get the new SQL collation struct, if this is a SQLCOLLATION change.
    #[must_use]
    pub fn new_sql_collation(&self) -> Option<Collation> {
        if self.env_type == EnvChangeType::SqlCollation {
            if let EnvChangeValue::Binary(bytes) = &self.new_value {
                let mut cursor = bytes.clone();
                return Collation::decode(&mut cursor).ok();
            }
        }
        None
    }
}

impl Order {
    /// Decode an ORDER token from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let length = src.get_u16_le() as usize;
        let column_count = length / 2;

        if src.remaining() < length {
            return Err(ProtocolError::IncompletePacket {
                expected: length,
                actual: src.remaining(),
            });
        }

        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            columns.push(src.get_u16_le());
        }

        Ok(Self { columns })
    }
}

impl FeatureExtAck {
    /// Feature terminator byte.
    pub const TERMINATOR: u8 = 0xFF;

    /// Decode a FEATUREEXTACK token from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut features = Vec::new();

        loop {
            if !src.has_remaining() {
                return Err(ProtocolError::UnexpectedEof);
            }

            let feature_id = src.get_u8();
            if feature_id == Self::TERMINATOR {
                break;
            }

            if src.remaining() < 4 {
                return Err(ProtocolError::UnexpectedEof);
            }

            let data_len = src.get_u32_le() as usize;

            if src.remaining() < data_len {
                return Err(ProtocolError::IncompletePacket {
                    expected: data_len,
                    actual: src.remaining(),
                });
            }

            let data = src.copy_to_bytes(data_len);
            features.push(FeatureAck { feature_id, data });
        }

        Ok(Self { features })
    }
}

impl SspiToken {
    /// Decode an SSPI token from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let length = src.get_u16_le() as usize;

        if src.remaining() < length {
            return Err(ProtocolError::IncompletePacket {
                expected: length,
                actual: src.remaining(),
            });
        }

        let data = src.copy_to_bytes(length);
        Ok(Self { data })
    }
}

impl FedAuthInfo {
    /// Decode a FEDAUTHINFO token from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 4 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let _length = src.get_u32_le();

        if src.remaining() < 5 {
            return Err(ProtocolError::UnexpectedEof);
        }

        let _count = src.get_u8();

        // Read option data
        let mut sts_url = String::new();
        let mut spn = String::new();

        // Parse info options until we have both
        while src.has_remaining() {
            if src.remaining() < 9 {
                break;
            }

            let info_id = src.get_u8();
            let info_len = src.get_u32_le() as usize;
            let _info_offset = src.get_u32_le();

            if src.remaining() < info_len {
                break;
            }

            // Read UTF-16LE string
            let char_count = info_len / 2;
            let mut chars = Vec::with_capacity(char_count);
            for _ in 0..char_count {
                chars.push(src.get_u16_le());
            }

            if let Ok(value) = String::from_utf16(&chars) {
                match info_id {
                    0x01 => spn = value,
                    0x02 => sts_url = value,
                    _ => {}
                }
            }
        }

        Ok(Self { sts_url, spn })
    }
}

// =============================================================================
// Token Parser
// =============================================================================

/// Token stream parser.
///
/// Parses a stream of TDS tokens from a byte buffer.
pub struct TokenParser {
    data: Bytes,
    position: usize,
    version: TdsVersion,
}

impl TokenParser {
    /// Create a new token parser from bytes, assuming TDS 7.4 (the widest
    /// DONE rowcount encoding). Use [`TokenParser::with_version`] when the
    /// negotiated version is known and may be older.
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self::with_version(data, TdsVersion::V7_4)
    }

    /// Create a new token parser for a specific negotiated TDS version.
    #[must_use]
    pub fn with_version(data: Bytes, version: TdsVersion) -> Self {
        Self {
            data,
            position: 0,
            version,
        }
    }

    /// The negotiated TDS version this parser was constructed with.
    #[must_use]
    pub fn version(&self) -> TdsVersion {
        self.version
    }

    /// Get remaining bytes in the buffer.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Check if there are more bytes to parse.
    #[must_use]
    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    /// Parse the next token from the stream.
    ///
    /// Returns `None` if no more tokens are available. ROW and NBCROW
    /// tokens cannot be parsed without column metadata; use
    /// [`TokenParser::next_token_with_metadata`] for result set streams.
    pub fn next_token(&mut self) -> Result<Option<Token>, ProtocolError> {
        self.next_token_impl(None)
    }

    /// Parse the next token from the stream, using `metadata` (the most
    /// recently seen COLMETADATA) to size ROW/NBCROW payloads.
    ///
    /// Returns `None` if no more tokens are available.
    pub fn next_token_with_metadata(
        &mut self,
        metadata: Option<&ColMetaData>,
    ) -> Result<Option<Token>, ProtocolError> {
        self.next_token_impl(metadata)
    }

    fn next_token_impl(
        &mut self,
        metadata: Option<&ColMetaData>,
    ) -> Result<Option<Token>, ProtocolError> {
        loop {
            if !self.has_remaining() {
                return Ok(None);
            }

            let start_pos = self.position;
            let slice_len = self.data.len() - start_pos;
            let mut buf = self.data.slice(start_pos..);

            let token_type_byte = buf.get_u8();
            let token_type = TokenType::from_u8(token_type_byte);

            let token = match token_type {
                Some(TokenType::Done) => Token::Done(Done::decode(&mut buf, self.version)?),
                Some(TokenType::DoneProc) => {
                    Token::DoneProc(DoneProc::decode(&mut buf, self.version)?)
                }
                Some(TokenType::DoneInProc) => {
                    Token::DoneInProc(DoneInProc::decode(&mut buf, self.version)?)
                }
                Some(TokenType::Error) => Token::Error(ServerError::decode(&mut buf)?),
                Some(TokenType::Info) => Token::Info(ServerInfo::decode(&mut buf)?),
                Some(TokenType::LoginAck) => Token::LoginAck(LoginAck::decode(&mut buf)?),
                Some(TokenType::EnvChange) => Token::EnvChange(EnvChange::decode(&mut buf)?),
                Some(TokenType::Order) => Token::Order(Order::decode(&mut buf)?),
                Some(TokenType::FeatureExtAck) => {
                    Token::FeatureExtAck(FeatureExtAck::decode(&mut buf)?)
                }
                Some(TokenType::Sspi) => Token::Sspi(SspiToken::decode(&mut buf)?),
                Some(TokenType::FedAuthInfo) => Token::FedAuthInfo(FedAuthInfo::decode(&mut buf)?),
                Some(TokenType::ReturnStatus) => {
                    if buf.remaining() < 4 {
                        return Err(ProtocolError::UnexpectedEof);
                    }
                    Token::ReturnStatus(buf.get_i32_le())
                }
                Some(TokenType::ColMetaData) => {
                    Token::ColMetaData(ColMetaData::decode(&mut buf, self.version)?)
                }
                Some(TokenType::ReturnValue) => {
                    Token::ReturnValue(ReturnValue::decode(&mut buf, self.version)?)
                }
                Some(TokenType::Row) => {
                    let meta = metadata.ok_or(ProtocolError::MissingColumnMetadata)?;
                    Token::Row(RawRow::decode_with_metadata(&mut buf, meta)?)
                }
                Some(TokenType::NbcRow) => {
                    let meta = metadata.ok_or(ProtocolError::MissingColumnMetadata)?;
                    Token::NbcRow(NbcRow::decode_with_metadata(&mut buf, meta)?)
                }
                // COLINFO and TABNAME are purely informational (deprecated
                // even in TDS terms); skip their bodies and move on.
                Some(TokenType::ColInfo) | Some(TokenType::TabName) => {
                    skip_length_prefixed_u16(&mut buf)?;
                    self.position = start_pos + (slice_len - buf.remaining());
                    continue;
                }
                Some(TokenType::Offset) => {
                    // Deprecated, fixed 6-byte body: Identifier + Offset + Length.
                    if buf.remaining() < 6 {
                        return Err(ProtocolError::UnexpectedEof);
                    }
                    buf.advance(6);
                    self.position = start_pos + (slice_len - buf.remaining());
                    continue;
                }
                Some(TokenType::SessionState) => {
                    if buf.remaining() < 4 {
                        return Err(ProtocolError::UnexpectedEof);
                    }
                    let len = buf.get_u32_le() as usize;
                    if buf.remaining() < len {
                        return Err(ProtocolError::IncompletePacket {
                            expected: len,
                            actual: buf.remaining(),
                        });
                    }
                    buf.advance(len);
                    self.position = start_pos + (slice_len - buf.remaining());
                    continue;
                }
                None => {
                    return Err(ProtocolError::InvalidTokenType(token_type_byte));
                }
            };

            // Update position based on how much was consumed.
            self.position = start_pos + (slice_len - buf.remaining());
            return Ok(Some(token));
        }
    }
}

fn skip_length_prefixed_u16(src: &mut impl Buf) -> Result<(), ProtocolError> {
    require(src, 2)?;
    let len = src.get_u16_le() as usize;
    require(src, len)?;
    src.advance(len);
    Ok(())
}

// =============================================================================
// no_std support
// =============================================================================

#[cfg(not(feature = "std"))]
use alloc::string::String;
#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_done_roundtrip() {
        let done = Done {
            status: DoneStatus {
                more: false,
                error: false,
                in_xact: false,
                count: true,
                attn: false,
                srverror: false,
            },
            cur_cmd: 193, // SELECT
            row_count: 42,
        };

        let mut buf = BytesMut::new();
        done.encode(&mut buf);

        // Skip the token type byte
        let mut cursor = &buf[1..];
        let decoded = Done::decode(&mut cursor, TdsVersion::V7_4).unwrap();

        assert_eq!(decoded.status.count, done.status.count);
        assert_eq!(decoded.cur_cmd, done.cur_cmd);
        assert_eq!(decoded.row_count, done.row_count);
    }

    #[test]
    fn test_done_legacy_rowcount_width() {
        // Pre-7.2 servers send a 4-byte rowcount; the 8-byte wide form must
        // not be assumed.
        let data = [
            0x10, 0x00, // status: DONE_COUNT
            0xC1, 0x00, // cur_cmd: 193 (SELECT)
            0x2A, 0x00, 0x00, 0x00, // row_count: 42 (4 bytes, not 8)
        ];
        let mut cursor = &data[..];
        let decoded = Done::decode(&mut cursor, TdsVersion::V7_1).unwrap();

        assert_eq!(decoded.row_count, 42);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_done_status_bits() {
        let status = DoneStatus {
            more: true,
            error: true,
            in_xact: true,
            count: true,
            attn: false,
            srverror: false,
        };

        let bits = status.to_bits();
        let restored = DoneStatus::from_bits(bits);

        assert_eq!(status.more, restored.more);
        assert_eq!(status.error, restored.error);
        assert_eq!(status.in_xact, restored.in_xact);
        assert_eq!(status.count, restored.count);
    }

    #[test]
    fn test_token_parser_done() {
        // DONE token: type (1) + status (2) + curcmd (2) + rowcount (8)
        let data = Bytes::from_static(&[
            0xFD, // DONE token type
            0x10, 0x00, // status: DONE_COUNT
            0xC1, 0x00, // cur_cmd: 193 (SELECT)
            0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // row_count: 5
        ]);

        let mut parser = TokenParser::new(data);
        let token = parser.next_token().unwrap().unwrap();

        match token {
            Token::Done(done) => {
                assert!(done.status.count);
                assert!(!done.status.more);
                assert_eq!(done.cur_cmd, 193);
                assert_eq!(done.row_count, 5);
            }
            _ => panic!("Expected Done token"),
        }

        // No more tokens
        assert!(parser.next_token().unwrap().is_none());
    }

    #[test]
    fn test_env_change_type_from_u8() {
        assert_eq!(
            EnvChangeType::from_u8(1),
            Some(EnvChangeType::Database)
        );
        assert_eq!(
            EnvChangeType::from_u8(20),
            Some(EnvChangeType::Routing)
        );
        assert_eq!(EnvChangeType::from_u8(100), None);
    }

    fn int_column(name: &str) -> ColumnData {
        ColumnData {
            name: name.to_string(),
            col_type: TypeId::Int4 as u8,
            type_id: TypeId::Int4,
            user_type: 0,
            flags: 0,
            type_info: TypeInfo::default(),
        }
    }

    fn nvarchar_column(name: &str) -> ColumnData {
        ColumnData {
            name: name.to_string(),
            col_type: TypeId::NVarChar as u8,
            type_id: TypeId::NVarChar,
            user_type: 0,
            flags: 0x01,
            type_info: TypeInfo {
                max_length: Some(100),
                precision: None,
                scale: None,
                collation: Some(Collation {
                    lcid: 0x0409,
                    sort_id: 0,
                }),
            },
        }
    }

    #[test]
    fn test_colmetadata_roundtrip() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(2); // column count

        buf.put_u32_le(0);
        buf.put_u16_le(0);
        buf.put_u8(TypeId::Int4 as u8);
        buf.put_u8(2); // "id" is 2 UTF-16 code units
        for c in "id".encode_utf16() {
            buf.put_u16_le(c);
        }

        buf.put_u32_le(0);
        buf.put_u16_le(0x01);
        buf.put_u8(TypeId::NVarChar as u8);
        buf.put_u16_le(100);
        buf.put_slice(&[0x09, 0x04, 0x00, 0x00, 0x00]); // collation
        buf.put_u8(4);
        for c in "name".encode_utf16() {
            buf.put_u16_le(c);
        }

        let mut cursor = buf.freeze();
        let meta = ColMetaData::decode(&mut cursor, TdsVersion::V7_4).unwrap();

        assert_eq!(meta.columns.len(), 2);
        assert_eq!(meta.columns[0].name, "id");
        assert_eq!(meta.columns[0].type_id, TypeId::Int4);
        assert_eq!(meta.columns[1].name, "name");
        assert_eq!(meta.columns[1].type_id, TypeId::NVarChar);
        assert_eq!(meta.columns[1].type_info.max_length, Some(100));
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_raw_row_decode_with_metadata() {
        let meta = ColMetaData {
            columns: vec![int_column("id"), nvarchar_column("name")],
        };

        let mut buf = BytesMut::new();
        buf.put_i32_le(7); // id = 7
        buf.put_u16_le(0xFFFF); // name = NULL (2-byte len sentinel)
        buf.put_u8(0xAA); // trailing byte belonging to the next token

        let mut cursor = buf.freeze();
        let row = RawRow::decode_with_metadata(&mut cursor, &meta).unwrap();

        assert_eq!(row.data.len(), 6); // 4 (int) + 2 (null nvarchar length)
        assert_eq!(cursor.len(), 1); // next token's byte untouched
    }

    #[test]
    fn test_nbc_row_null_bitmap() {
        let meta = ColMetaData {
            columns: vec![int_column("a"), int_column("b"), int_column("c")],
        };

        let mut buf = BytesMut::new();
        buf.put_u8(0b0000_0010); // column 1 ("b") is null
        buf.put_i32_le(1); // a
        buf.put_i32_le(3); // c (b is omitted entirely)

        let mut cursor = buf.freeze();
        let row = NbcRow::decode_with_metadata(&mut cursor, &meta).unwrap();

        assert!(!row.is_null(0));
        assert!(row.is_null(1));
        assert!(!row.is_null(2));
        assert_eq!(row.data.len(), 8);
    }

    #[test]
    fn test_return_value_decode() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(1); // ordinal
        buf.put_u8(2); // name length
        for c in "@p".encode_utf16() {
            buf.put_u16_le(c);
        }
        buf.put_u8(0); // status
        buf.put_u32_le(0); // user_type
        buf.put_u16_le(0); // flags
        buf.put_u8(TypeId::Int4 as u8);
        buf.put_i32_le(99);

        let mut cursor = buf.freeze();
        let rv = ReturnValue::decode(&mut cursor, TdsVersion::V7_4).unwrap();

        assert_eq!(rv.param_ordinal, 1);
        assert_eq!(rv.param_name, "@p");
        assert_eq!(rv.value.len(), 4);
    }

    #[test]
    fn test_env_change_sql_collation_binary() {
        let mut buf = BytesMut::new();
        // length placeholder, filled after body is known
        let body_start = buf.len();
        buf.put_u16_le(0);
        buf.put_u8(EnvChangeType::SqlCollation as u8);
        buf.put_u8(5); // new value length
        buf.put_slice(&[0x09, 0x04, 0x00, 0x00, 0x00]);
        buf.put_u8(0); // old value length

        let body_len = (buf.len() - body_start - 2) as u16;
        buf[body_start..body_start + 2].copy_from_slice(&body_len.to_le_bytes());

        let mut cursor = buf.freeze();
        let env = EnvChange::decode(&mut cursor).unwrap();

        let collation = env.new_sql_collation().unwrap();
        assert_eq!(collation.lcid, 0x0409);
    }
}
