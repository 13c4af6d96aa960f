/// Engine configuration.
///
/// Holds the paging and encoding knobs shared by every `DataView` of a
/// client. Values come from code (`Default`), a JSON document, or the
/// environment.

use serde::Deserialize;

/// Which edge of the window incoming chunk rows are attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum InsertSide {
    /// Prepend to the window ("B" on the wire)
    #[serde(alias = "B", alias = "begin")]
    Begin,
    /// Append to the window ("E" on the wire)
    #[default]
    #[serde(alias = "E", alias = "end")]
    End,
}

impl InsertSide {
    /// Parse the wire form ("B" / "E")
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "B" | "b" => Some(InsertSide::Begin),
            "E" | "e" => Some(InsertSide::End),
            _ => None,
        }
    }
}

/// Rendering used for record value buffers on the wire.
///
/// Hex is the normal form; base64 is the compact form selected by the
/// debug-level switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireEncoding {
    #[default]
    Hex,
    Base64,
}

impl WireEncoding {
    /// Parse an encoding name.
    ///
    /// Accepts: "hex", "base64"
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "hex" => Ok(WireEncoding::Hex),
            "base64" | "b64" => Ok(WireEncoding::Base64),
            _ => Err(format!(
                "Unknown wire encoding: '{}'. Use 'hex' or 'base64'",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows requested per chunk fetch
    pub chunk_size: usize,
    /// Default side incoming rows are attached to
    pub insert_at: InsertSide,
    /// Value buffer rendering
    pub wire_encoding: WireEncoding,
    /// ALPHA truncation counts non-ASCII characters as two bytes
    pub double_byte_locale: bool,
    /// Upper bound on fetches performed by a single navigation
    pub max_fetch_retries: usize,
    /// Window size limit; 0 means unlimited
    pub max_window_records: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chunk_size: 30,
            insert_at: InsertSide::End,
            wire_encoding: WireEncoding::Hex,
            double_byte_locale: false,
            max_fetch_retries: 8,
            max_window_records: 0,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("config parse error: {}", e))
    }

    /// Build a configuration from `DATAVIEW_*` environment variables,
    /// falling back to defaults for anything unset or malformed.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();

        if let Some(v) = lookup("DATAVIEW_CHUNK_SIZE") {
            match v.parse() {
                Ok(n) => config.chunk_size = n,
                Err(_) => log::warn!("ignoring DATAVIEW_CHUNK_SIZE={:?}", v),
            }
        }
        if let Some(v) = lookup("DATAVIEW_WIRE_ENCODING") {
            match WireEncoding::from_str(&v) {
                Ok(enc) => config.wire_encoding = enc,
                Err(e) => log::warn!("{}", e),
            }
        }
        if let Some(v) = lookup("DATAVIEW_DOUBLE_BYTE") {
            config.double_byte_locale = matches!(v.as_str(), "1" | "true" | "TRUE" | "yes");
        }
        if let Some(v) = lookup("DATAVIEW_MAX_FETCH_RETRIES") {
            match v.parse() {
                Ok(n) => config.max_fetch_retries = n,
                Err(_) => log::warn!("ignoring DATAVIEW_MAX_FETCH_RETRIES={:?}", v),
            }
        }
        if let Some(v) = lookup("DATAVIEW_MAX_WINDOW_RECORDS") {
            match v.parse() {
                Ok(n) => config.max_window_records = n,
                Err(_) => log::warn!("ignoring DATAVIEW_MAX_WINDOW_RECORDS={:?}", v),
            }
        }

        config
    }
}
