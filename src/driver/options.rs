use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_MAX_PACKET_LENGTH;

/// Toggles applied to one dump. Serialized verbatim into the `-- options:` trailer line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DumpOptions {
    pub include_data: bool,
    pub include_create_db: bool,
    /// PostgreSQL only, and only honoured together with `include_create_db`.
    pub drop_db_before_create: bool,
    pub include_comments: bool,
    pub include_charsets: bool,
    pub include_tablespaces: bool,
    /// MySQL only.
    pub remove_auto_increment_state: bool,
    /// MySQL only.
    pub max_packet_length: u64,
}

impl Default for DumpOptions {
    fn default() -> Self {
        DumpOptions {
            include_data: true,
            include_create_db: true,
            drop_db_before_create: false,
            include_comments: true,
            include_charsets: true,
            include_tablespaces: true,
            remove_auto_increment_state: true,
            max_packet_length: DEFAULT_MAX_PACKET_LENGTH,
        }
    }
}

impl DumpOptions {
    pub fn with_data(mut self, include: bool) -> Self {
        self.include_data = include;
        self
    }

    pub fn with_create_db(mut self, include: bool) -> Self {
        self.include_create_db = include;
        self
    }

    pub fn with_drop_db(mut self, drop: bool) -> Self {
        self.drop_db_before_create = drop;
        self
    }

    pub fn with_comments(mut self, include: bool) -> Self {
        self.include_comments = include;
        self
    }

    pub fn with_charsets(mut self, include: bool) -> Self {
        self.include_charsets = include;
        self
    }

    pub fn with_tablespaces(mut self, include: bool) -> Self {
        self.include_tablespaces = include;
        self
    }

    pub fn with_auto_increment_removed(mut self, remove: bool) -> Self {
        self.remove_auto_increment_state = remove;
        self
    }

    pub fn with_max_packet_length(mut self, length: u64) -> Self {
        self.max_packet_length = length;
        self
    }

    /// Whether `DROP DATABASE` ends up in the dump. Dropping without creating is ignored.
    pub fn drops_database(&self) -> bool {
        self.include_create_db && self.drop_db_before_create
    }
}
