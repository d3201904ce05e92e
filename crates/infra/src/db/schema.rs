//! Schema for the pipeline tables.
//!
//! Unique constraints carry the idempotency guarantees:
//! `print_jobs.idempotency_key`, `webhook_events.event_id`,
//! `checkout_attempts.attempt_token` and `checkout_attempts.idempotency_key`.

pub const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT,
        order_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending_payment',
        print_size TEXT,
        quantity INTEGER NOT NULL DEFAULT 1,
        print_product TEXT,
        material TEXT,
        sides TEXT,
        layout_id TEXT,
        artifact_key TEXT,
        shipping_name TEXT,
        shipping_address TEXT,
        shipping_city TEXT,
        shipping_state TEXT,
        shipping_zip TEXT,
        checkout_session_id TEXT,
        payment_intent_id TEXT,
        amount_total_cents BIGINT,
        currency TEXT,
        fulfillment_error TEXT,
        provider_job_id TEXT,
        print_idempotency_key TEXT,
        paid_at TIMESTAMPTZ,
        submitted_at TIMESTAMPTZ,
        fulfilled_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS orders_pending_idx
        ON orders (status, created_at)
        WHERE status = 'pending_payment'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS async_jobs (
        id UUID PRIMARY KEY,
        job_type TEXT NOT NULL CHECK (job_type <> ''),
        payload JSONB NOT NULL DEFAULT '{}'::jsonb,
        status TEXT NOT NULL DEFAULT 'queued',
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        locked_at TIMESTAMPTZ,
        locked_by TEXT,
        next_run_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS async_jobs_ready_idx
        ON async_jobs (status, next_run_at, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS print_jobs (
        job_id UUID PRIMARY KEY,
        idempotency_key TEXT NOT NULL UNIQUE,
        order_id BIGINT NOT NULL,
        filename TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        shipping_json JSONB,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        claimed_at TIMESTAMPTZ,
        next_retry_at TIMESTAMPTZ,
        downloaded_at TIMESTAMPTZ,
        printed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS print_jobs_ready_idx
        ON print_jobs (status, next_retry_at, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS print_jobs_order_idx ON print_jobs (order_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS webhook_events (
        event_id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'received',
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS checkout_attempts (
        attempt_token TEXT PRIMARY KEY,
        idempotency_key TEXT NOT NULL UNIQUE,
        purpose TEXT NOT NULL,
        params_hash TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'created',
        user_id BIGINT,
        order_id BIGINT,
        external_session_id TEXT,
        external_customer_id TEXT,
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS checkout_attempts_order_idx
        ON checkout_attempts (order_id, purpose, created_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS subscriptions (
        user_id BIGINT PRIMARY KEY,
        customer_id TEXT,
        subscription_id TEXT,
        status TEXT NOT NULL,
        current_period_end TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS subscriptions_customer_idx ON subscriptions (customer_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS subscriptions_subscription_idx ON subscriptions (subscription_id)
    "#,
];
