/// Current schema version. Bumping it invalidates existing database files
/// (clean-slate policy; there is no in-place migration).
pub const SCHEMA_VERSION: i64 = 1;

/// Connection pragmas applied on every open.
pub const PRAGMAS: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA busy_timeout=5000;
    PRAGMA foreign_keys=ON;
    PRAGMA temp_store=MEMORY;
";

/// Full schema, applied once on a fresh database.
pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS schema_meta (
        id      INTEGER PRIMARY KEY CHECK (id = 1),
        version INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tasks (
        id          TEXT PRIMARY KEY,
        project_id  TEXT NOT NULL,
        status      TEXT NOT NULL,
        queue       TEXT NOT NULL,
        priority    TEXT NOT NULL,
        weight      TEXT NOT NULL,
        data        TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
    CREATE INDEX IF NOT EXISTS idx_tasks_status  ON tasks(status);
    CREATE INDEX IF NOT EXISTS idx_tasks_queue   ON tasks(queue);

    CREATE TABLE IF NOT EXISTS plans (
        task_id    TEXT PRIMARY KEY REFERENCES tasks(id) ON DELETE CASCADE,
        data       TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS phases (
        task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        phase   TEXT NOT NULL,
        data    TEXT NOT NULL,
        PRIMARY KEY (task_id, phase)
    );

    CREATE TABLE IF NOT EXISTS states (
        task_id    TEXT PRIMARY KEY REFERENCES tasks(id) ON DELETE CASCADE,
        data       TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS specs (
        task_id    TEXT PRIMARY KEY REFERENCES tasks(id) ON DELETE CASCADE,
        content    TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS initiatives (
        id          TEXT PRIMARY KEY,
        title       TEXT NOT NULL,
        description TEXT,
        data        TEXT,
        created_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS transcripts (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id   TEXT NOT NULL,
        phase     TEXT NOT NULL,
        iteration INTEGER NOT NULL,
        role      TEXT NOT NULL,
        content   TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_transcripts_task ON transcripts(task_id, phase, iteration);

    CREATE VIRTUAL TABLE IF NOT EXISTS transcripts_fts USING fts5(
        content,
        content='transcripts',
        content_rowid='id'
    );

    CREATE TABLE IF NOT EXISTS attachments (
        id           TEXT PRIMARY KEY,
        task_id      TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        filename     TEXT NOT NULL,
        content_type TEXT,
        size_bytes   INTEGER,
        path         TEXT NOT NULL,
        created_at   TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cost_log (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id            TEXT NOT NULL,
        task_id               TEXT NOT NULL,
        phase                 TEXT NOT NULL,
        model                 TEXT NOT NULL,
        iteration             INTEGER NOT NULL,
        cost_usd              REAL NOT NULL,
        input_tokens          INTEGER NOT NULL,
        output_tokens         INTEGER NOT NULL,
        cache_creation_tokens INTEGER NOT NULL,
        cache_read_tokens     INTEGER NOT NULL,
        total_tokens          INTEGER NOT NULL,
        timestamp             TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_cost_log_project ON cost_log(project_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_cost_log_task    ON cost_log(task_id);

    CREATE TABLE IF NOT EXISTS cost_aggregates (
        day          TEXT NOT NULL,
        model        TEXT NOT NULL,
        phase        TEXT NOT NULL,
        cost_usd     REAL NOT NULL DEFAULT 0,
        total_tokens INTEGER NOT NULL DEFAULT 0,
        entries      INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (day, model, phase)
    );

    CREATE TABLE IF NOT EXISTS cost_budgets (
        project_id        TEXT PRIMARY KEY,
        monthly_limit_usd REAL NOT NULL,
        alert_threshold   REAL NOT NULL DEFAULT 0.8,
        updated_at        TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS decisions (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id   TEXT NOT NULL,
        phase     TEXT NOT NULL,
        gate_type TEXT NOT NULL,
        decision  TEXT NOT NULL,
        approver  TEXT,
        rationale TEXT,
        questions TEXT,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_decisions_task ON decisions(task_id);

    CREATE TABLE IF NOT EXISTS task_comments (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id    TEXT NOT NULL,
        author     TEXT NOT NULL,
        body       TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
";
