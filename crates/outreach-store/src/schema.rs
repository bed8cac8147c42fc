//! Schema, applied on every open, every statement idempotent.

pub(crate) const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS leads (
        id TEXT PRIMARY KEY,
        first_name TEXT NOT NULL,
        last_name TEXT,
        email TEXT,
        phone TEXT,
        push_token TEXT,
        status TEXT NOT NULL DEFAULT 'NEW',
        source TEXT,
        score INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS campaigns (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        meta TEXT,                          -- JSON, forwarded to queue jobs
        instantly_campaign_id TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS email_templates (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        subject TEXT NOT NULL,
        html_body TEXT NOT NULL,
        text_body TEXT
    );

    CREATE TABLE IF NOT EXISTS scripts (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        channel TEXT NOT NULL,
        subject TEXT,
        content TEXT NOT NULL,
        template_id TEXT,
        assistant_id TEXT,
        campaign_id TEXT,
        is_default INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS contact_attempts (
        id TEXT PRIMARY KEY,
        lead_id TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
        channel TEXT NOT NULL,
        campaign_id TEXT,
        script_id TEXT,
        status TEXT NOT NULL DEFAULT 'PENDING',
        provider TEXT,
        provider_ref TEXT,
        started_at TEXT,
        completed_at TEXT,
        duration_secs INTEGER,
        cost REAL,
        result TEXT,                        -- JSON AttemptResult
        notes TEXT,
        ab_test_id TEXT,
        ab_variant TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_attempts_provider_ref ON contact_attempts(provider_ref);
    CREATE INDEX IF NOT EXISTS idx_attempts_status ON contact_attempts(status, created_at);
    CREATE INDEX IF NOT EXISTS idx_attempts_lead ON contact_attempts(lead_id);

    CREATE TABLE IF NOT EXISTS retention_sequences (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'DRAFT',
        campaign_id TEXT,
        trigger_type TEXT,
        exit_on_conversion INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sequence_steps (
        id TEXT PRIMARY KEY,
        sequence_id TEXT NOT NULL REFERENCES retention_sequences(id) ON DELETE CASCADE,
        step_order INTEGER NOT NULL,
        channel TEXT NOT NULL,
        delay_value INTEGER NOT NULL DEFAULT 0,
        delay_unit TEXT NOT NULL DEFAULT 'HOURS',
        script_id TEXT,
        subject TEXT,
        content TEXT,
        condition TEXT,                     -- JSON StepCondition
        UNIQUE (sequence_id, step_order)
    );

    CREATE TABLE IF NOT EXISTS sequence_enrollments (
        id TEXT PRIMARY KEY,
        sequence_id TEXT NOT NULL REFERENCES retention_sequences(id) ON DELETE CASCADE,
        lead_id TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
        status TEXT NOT NULL DEFAULT 'ACTIVE',
        current_step INTEGER NOT NULL DEFAULT 0,
        enrolled_at TEXT NOT NULL,
        completed_at TEXT,
        last_step_at TEXT,
        source TEXT,
        UNIQUE (sequence_id, lead_id)
    );
    CREATE INDEX IF NOT EXISTS idx_enrollments_status ON sequence_enrollments(sequence_id, status);

    CREATE TABLE IF NOT EXISTS sequence_step_executions (
        id TEXT PRIMARY KEY,
        enrollment_id TEXT NOT NULL REFERENCES sequence_enrollments(id) ON DELETE CASCADE,
        step_id TEXT NOT NULL REFERENCES sequence_steps(id) ON DELETE CASCADE,
        status TEXT NOT NULL DEFAULT 'SCHEDULED',
        scheduled_at TEXT NOT NULL,
        executed_at TEXT,
        contact_attempt_id TEXT REFERENCES contact_attempts(id) ON DELETE SET NULL,
        result TEXT,                        -- JSON StepExecutionResult
        UNIQUE (enrollment_id, step_id)
    );
    CREATE INDEX IF NOT EXISTS idx_executions_attempt ON sequence_step_executions(contact_attempt_id);

    CREATE TABLE IF NOT EXISTS ab_tests (
        id TEXT PRIMARY KEY,
        campaign_id TEXT NOT NULL,
        channel TEXT NOT NULL,
        variant_a TEXT NOT NULL,
        variant_b TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'RUNNING',
        stats_a TEXT NOT NULL DEFAULT '{\"sent\":0,\"converted\":0}',
        stats_b TEXT NOT NULL DEFAULT '{\"sent\":0,\"converted\":0}',
        winner_id TEXT,
        started_at TEXT NOT NULL,
        ended_at TEXT
    );

    CREATE TABLE IF NOT EXISTS scheduled_contacts (
        id TEXT PRIMARY KEY,
        lead_id TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
        campaign_id TEXT,
        channel TEXT NOT NULL,
        script_id TEXT,
        scheduled_at TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'PENDING',
        attempt_id TEXT,
        error TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_scheduled_due ON scheduled_contacts(status, scheduled_at);

    CREATE TABLE IF NOT EXISTS conversion_rules (
        channel TEXT NOT NULL,
        source TEXT NOT NULL,
        leads INTEGER NOT NULL,
        conversions INTEGER NOT NULL,
        rate REAL NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (channel, source)
    );

    CREATE TABLE IF NOT EXISTS dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task TEXT NOT NULL,
        error TEXT NOT NULL,
        context TEXT,
        created_at TEXT NOT NULL
    );
";
