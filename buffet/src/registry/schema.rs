//! SQLite schema for the session registry.

/// Bumped whenever `SCHEMA` changes shape.
pub const SCHEMA_VERSION: i64 = 1;

/// One row per live or in-flight session.
///
/// The two UNIQUE constraints are what make a reservation atomic: an
/// insert either claims both the owner and the slot or fails.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id                 TEXT PRIMARY KEY NOT NULL,
    owner_id           TEXT NOT NULL UNIQUE,
    slot               INTEGER NOT NULL UNIQUE,
    public_port        INTEGER NOT NULL,
    display_port       INTEGER NOT NULL,
    image_ref          TEXT NOT NULL,
    status             TEXT NOT NULL,
    hypervisor_pid     INTEGER,
    proxy_pid          INTEGER,
    display_credential TEXT,
    control_socket     TEXT NOT NULL,
    traffic_log        TEXT NOT NULL,
    created_at         INTEGER NOT NULL
);
"#;

pub const SELECT_COLUMNS: &str = "id, owner_id, slot, public_port, display_port, image_ref, \
     status, hypervisor_pid, proxy_pid, display_credential, control_socket, traffic_log, \
     created_at";
