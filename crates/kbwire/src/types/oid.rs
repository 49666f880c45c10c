//! Type Object IDs and the per-dialect catalogs.
//!
//! Most OIDs are shared by every compatibility mode. A handful of types
//! (tinyint, date, time, datetime, bit) carry different OIDs depending on the
//! mode the server runs in, so a connection resolves an [`OidCatalog`] once at
//! startup and classifies every column through it.

/// Boolean type
pub const BOOL: u32 = 16;
/// Byte array (bytea)
pub const BYTEA: u32 = 17;
/// Single character (char)
pub const CHAR: u32 = 18;
/// Name type
pub const NAME: u32 = 19;
/// 8-byte signed integer (int8)
pub const INT8: u32 = 20;
/// 2-byte signed integer (int2)
pub const INT2: u32 = 21;
/// 4-byte signed integer (int4)
pub const INT4: u32 = 23;
/// Variable-length text
pub const TEXT: u32 = 25;
/// Object identifier
pub const OID: u32 = 26;
/// JSON (text-based)
pub const JSON: u32 = 114;
/// Single-precision float
pub const FLOAT4: u32 = 700;
/// Double-precision float
pub const FLOAT8: u32 = 701;
/// Unknown (untyped literal)
pub const UNKNOWN: u32 = 705;
/// Money
pub const MONEY: u32 = 790;
/// Blank-padded character (bpchar)
pub const BPCHAR: u32 = 1042;
/// Variable-length character with limit (varchar)
pub const VARCHAR: u32 = 1043;
/// Date in the default catalog
pub const DATE: u32 = 1082;
/// Time without time zone in the default catalog
pub const TIME: u32 = 1083;
/// Timestamp without time zone
pub const TIMESTAMP: u32 = 1114;
/// Timestamp with time zone
pub const TIMESTAMPTZ: u32 = 1184;
/// Time with time zone
pub const TIMETZ: u32 = 1266;
/// Fixed-length bit string in the default catalog
pub const BIT: u32 = 1560;
/// Variable-length bit string
pub const VARBIT: u32 = 1562;
/// Arbitrary precision numeric
pub const NUMERIC: u32 = 1700;
/// Cursor reference
pub const REFCURSOR: u32 = 1790;
/// UUID
pub const UUID: u32 = 2950;
/// Binary JSON
pub const JSONB: u32 = 3802;
/// Datetime in the default catalog
pub const DATETIME: u32 = 4189;

/// Fixed-length binary (mssql compatible)
pub const BINARY: u32 = 5022;
/// Variable-length binary (mssql compatible)
pub const VARBINARY: u32 = 5024;
/// National fixed-length character
pub const NCHAR: u32 = 5039;
/// National variable-length character
pub const NVARCHAR: u32 = 5041;
/// smallint alias of int2
pub const SMALLINT: u32 = 5061;
/// int alias of int4
pub const INT: u32 = 5063;
/// bigint alias of int8
pub const BIGINT: u32 = 5065;
/// real alias of float4
pub const REAL: u32 = 6069;
/// float alias of float8
pub const FLOAT: u32 = 6071;
/// mysql longtext
pub const LONGTEXT: u32 = 7018;
/// mysql mediumtext
pub const MEDIUMTEXT: u32 = 7019;
/// mysql tinytext
pub const TINYTEXT: u32 = 7020;
/// mysql longblob
pub const LONGBLOB: u32 = 7021;
/// mysql mediumblob
pub const MEDIUMBLOB: u32 = 7022;
/// mysql tinyblob
pub const TINYBLOB: u32 = 7023;
/// Binary large object
pub const BLOB: u32 = 8013;
/// bpchar measured in bytes
pub const BPCHARBYTE: u32 = 8016;
/// varchar measured in bytes
pub const VARCHARBYTE: u32 = 8018;
/// Oracle-style DATE (date plus time of day)
pub const ORA_DATE: u32 = 8020;
/// Tinyint in the default catalog
pub const TINYINT: u32 = 8100;

/// sqlserver-mode tinyint
pub const SQLSERVER_TINYINT: u32 = 5026;
/// sqlserver-mode date
pub const SQLSERVER_DATE: u32 = 7754;
/// sqlserver-mode time
pub const SQLSERVER_TIME: u32 = 7755;
/// sqlserver-mode datetime
pub const SQLSERVER_DATETIME: u32 = 7881;
/// sqlserver-mode bit
pub const SQLSERVER_BIT: u32 = 7915;

// Array types
pub const BOOL_ARRAY: u32 = 1000;
pub const BYTEA_ARRAY: u32 = 1001;
pub const INT2_ARRAY: u32 = 1005;
pub const INT4_ARRAY: u32 = 1007;
pub const TEXT_ARRAY: u32 = 1009;
pub const BPCHAR_ARRAY: u32 = 1014;
pub const VARCHAR_ARRAY: u32 = 1015;
pub const INT8_ARRAY: u32 = 1016;
pub const FLOAT4_ARRAY: u32 = 1021;
pub const FLOAT8_ARRAY: u32 = 1022;
pub const TIMESTAMP_ARRAY: u32 = 1115;
pub const DATE_ARRAY: u32 = 1182;
pub const NUMERIC_ARRAY: u32 = 1231;
pub const UUID_ARRAY: u32 = 2951;

/// Compatibility mode reported by `show database_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Oracle,
    MySql,
    SqlServer,
}

impl Dialect {
    /// Map the server's mode string. Unknown modes fall back to Oracle.
    pub fn from_mode(mode: &str) -> Self {
        match mode.trim().to_ascii_lowercase().as_str() {
            "sqlserver" => Dialect::SqlServer,
            "mysql" => Dialect::MySql,
            "oracle" | "" => Dialect::Oracle,
            other => {
                tracing::warn!(mode = other, "unknown database_mode, assuming oracle");
                Dialect::Oracle
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Oracle => "oracle",
            Dialect::MySql => "mysql",
            Dialect::SqlServer => "sqlserver",
        }
    }

    /// The catalog of mode-dependent OIDs.
    pub fn catalog(self) -> OidCatalog {
        match self {
            Dialect::Oracle => OidCatalog {
                date: ORA_DATE,
                ..OidCatalog::BASE
            },
            Dialect::MySql => OidCatalog::BASE,
            Dialect::SqlServer => OidCatalog {
                tinyint: SQLSERVER_TINYINT,
                date: SQLSERVER_DATE,
                time: SQLSERVER_TIME,
                datetime: SQLSERVER_DATETIME,
                bit: SQLSERVER_BIT,
            },
        }
    }
}

/// OIDs that differ between compatibility modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OidCatalog {
    pub tinyint: u32,
    pub date: u32,
    pub time: u32,
    pub datetime: u32,
    pub bit: u32,
}

impl OidCatalog {
    pub const BASE: OidCatalog = OidCatalog {
        tinyint: TINYINT,
        date: DATE,
        time: TIME,
        datetime: DATETIME,
        bit: BIT,
    };
}

/// Semantic kind of a column or parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Bool,
    Bytea,
    Int2,
    Int4,
    Int8,
    TinyInt,
    Float4,
    Float8,
    Numeric,
    Money,
    Text,
    Json,
    /// Raw bytes passed through unchanged (blobs, bit strings)
    RawBytes,
    /// `0x`-prefixed hex in text form
    Binary,
    Date,
    Time,
    TimeTz,
    Timestamp,
    TimestampTz,
    Uuid,
    Refcursor,
    /// Array with the given element OID
    Array(u32),
    Unknown,
}

impl OidCatalog {
    /// Classify a type OID.
    pub fn kind(&self, oid: u32) -> TypeKind {
        // Mode-dependent OIDs first; the base OIDs below stay valid in every mode.
        if oid == self.tinyint {
            return TypeKind::TinyInt;
        }
        if oid == self.date {
            return TypeKind::Date;
        }
        if oid == self.time {
            return TypeKind::Time;
        }
        if oid == self.datetime {
            return TypeKind::Timestamp;
        }
        if oid == self.bit {
            return TypeKind::RawBytes;
        }
        match oid {
            BOOL => TypeKind::Bool,
            TINYINT => TypeKind::TinyInt,
            DATE => TypeKind::Date,
            TIME => TypeKind::Time,
            DATETIME => TypeKind::Timestamp,
            BIT => TypeKind::RawBytes,
            BYTEA => TypeKind::Bytea,
            INT2 | SMALLINT => TypeKind::Int2,
            INT4 | INT => TypeKind::Int4,
            INT8 | BIGINT | OID => TypeKind::Int8,
            FLOAT4 | REAL => TypeKind::Float4,
            FLOAT8 | FLOAT => TypeKind::Float8,
            NUMERIC => TypeKind::Numeric,
            MONEY => TypeKind::Money,
            CHAR | NAME | TEXT | BPCHAR | VARCHAR | NCHAR | NVARCHAR | LONGTEXT | MEDIUMTEXT
            | TINYTEXT | BPCHARBYTE | VARCHARBYTE | UNKNOWN => TypeKind::Text,
            JSON | JSONB => TypeKind::Json,
            BLOB | LONGBLOB | MEDIUMBLOB | TINYBLOB | VARBIT => TypeKind::RawBytes,
            BINARY | VARBINARY => TypeKind::Binary,
            TIMETZ => TypeKind::TimeTz,
            TIMESTAMP => TypeKind::Timestamp,
            TIMESTAMPTZ => TypeKind::TimestampTz,
            UUID => TypeKind::Uuid,
            REFCURSOR => TypeKind::Refcursor,
            _ => element_of(oid).map_or(TypeKind::Unknown, TypeKind::Array),
        }
    }

    /// Whether result columns of this type are requested in binary format.
    pub fn prefers_binary(&self, oid: u32) -> bool {
        matches!(
            self.kind(oid),
            TypeKind::Bytea
                | TypeKind::Binary
                | TypeKind::Int2
                | TypeKind::Int4
                | TypeKind::Int8
                | TypeKind::TinyInt
                | TypeKind::Uuid
        ) && oid != OID
    }
}

/// Element OID of a known array type.
pub fn element_of(array_oid: u32) -> Option<u32> {
    Some(match array_oid {
        BOOL_ARRAY => BOOL,
        BYTEA_ARRAY => BYTEA,
        INT2_ARRAY => INT2,
        INT4_ARRAY => INT4,
        TEXT_ARRAY => TEXT,
        BPCHAR_ARRAY => BPCHAR,
        VARCHAR_ARRAY => VARCHAR,
        INT8_ARRAY => INT8,
        FLOAT4_ARRAY => FLOAT4,
        FLOAT8_ARRAY => FLOAT8,
        TIMESTAMP_ARRAY => TIMESTAMP,
        DATE_ARRAY => DATE,
        NUMERIC_ARRAY => NUMERIC,
        UUID_ARRAY => UUID,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_mode() {
        assert_eq!(Dialect::from_mode("sqlserver"), Dialect::SqlServer);
        assert_eq!(Dialect::from_mode("MySQL"), Dialect::MySql);
        assert_eq!(Dialect::from_mode("oracle"), Dialect::Oracle);
        assert_eq!(Dialect::from_mode(""), Dialect::Oracle);
        assert_eq!(Dialect::from_mode("pg"), Dialect::Oracle);
    }

    #[test]
    fn test_catalogs_are_independent() {
        let ora = Dialect::Oracle.catalog();
        let mssql = Dialect::SqlServer.catalog();
        let mysql = Dialect::MySql.catalog();

        assert_eq!(ora.kind(ORA_DATE), TypeKind::Date);
        assert_eq!(mysql.kind(DATE), TypeKind::Date);
        assert_eq!(mssql.kind(SQLSERVER_DATE), TypeKind::Date);
        assert_eq!(mssql.kind(SQLSERVER_TINYINT), TypeKind::TinyInt);
        assert_eq!(mysql.kind(TINYINT), TypeKind::TinyInt);
        assert_eq!(mssql.kind(SQLSERVER_BIT), TypeKind::RawBytes);
        assert_eq!(mssql.kind(SQLSERVER_DATETIME), TypeKind::Timestamp);
        assert_eq!(mssql.kind(DATE), TypeKind::Date);
        assert_eq!(ora.kind(DATE), TypeKind::Date);
    }

    #[test]
    fn test_shared_kinds() {
        let c = Dialect::Oracle.catalog();
        assert_eq!(c.kind(INT4), TypeKind::Int4);
        assert_eq!(c.kind(BIGINT), TypeKind::Int8);
        assert_eq!(c.kind(NVARCHAR), TypeKind::Text);
        assert_eq!(c.kind(VARBINARY), TypeKind::Binary);
        assert_eq!(c.kind(INT4_ARRAY), TypeKind::Array(INT4));
        assert_eq!(c.kind(999_999), TypeKind::Unknown);
    }

    #[test]
    fn test_binary_preference() {
        let c = Dialect::MySql.catalog();
        assert!(c.prefers_binary(INT8));
        assert!(c.prefers_binary(UUID));
        assert!(c.prefers_binary(BYTEA));
        assert!(c.prefers_binary(TINYINT));
        assert!(!c.prefers_binary(TEXT));
        assert!(!c.prefers_binary(NUMERIC));
        assert!(!c.prefers_binary(OID));
    }
}
