//! Relational persistence.
//!
//! Global tables (`agents`, `whatsapp_configurations`, `whatsapp_delivery_logs`)
//! are created by the migrations. Tenant tables are addressed through
//! [`TenantTables`], whose identifiers are already validated and quoted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::tenant::{TenantPrefix, TenantTables};
use crate::types::{
    Agent, Customer, DeliveryLog, DeliveryStatusUpdate, Message, NewMessage, Template,
    WhatsAppConfiguration,
};

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_configuration_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> StoreResult<Option<WhatsAppConfiguration>>;

    async fn find_active_configuration(
        &self,
        user_id: &str,
    ) -> StoreResult<Option<WhatsAppConfiguration>>;

    async fn find_agent_by_user_id(&self, user_id: &str) -> StoreResult<Option<Agent>>;

    /// Inserts the customer if the phone is unseen, otherwise bumps
    /// `last_user_message_time`. One statement, safe under concurrent calls.
    async fn upsert_inbound_customer(
        &self,
        tables: &TenantTables,
        phone_number: &str,
        name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Customer>;

    /// Matches on the digits of the stored phone number.
    async fn find_customer_by_phone(
        &self,
        tables: &TenantTables,
        phone_digits: &str,
    ) -> StoreResult<Option<Customer>>;

    async fn insert_message(&self, tables: &TenantTables, message: &NewMessage)
        -> StoreResult<Message>;

    async fn find_template_by_name(
        &self,
        tables: &TenantTables,
        agent_id: i64,
        name: &str,
    ) -> StoreResult<Option<Template>>;

    /// Any active template when `category` is `None`.
    async fn find_active_template_for_category(
        &self,
        tables: &TenantTables,
        agent_id: i64,
        category: Option<&str>,
    ) -> StoreResult<Option<Template>>;

    /// Conditional decrement; `None` when the balance does not cover `amount`.
    async fn debit_credits(&self, agent_id: i64, amount: f64) -> StoreResult<Option<f64>>;

    async fn current_credits(&self, agent_id: i64) -> StoreResult<Option<f64>>;

    /// Returns a previously debited amount; `None` when the agent is gone.
    async fn refund_credits(&self, agent_id: i64, amount: f64) -> StoreResult<Option<f64>>;

    async fn record_delivery(&self, log: &DeliveryLog) -> StoreResult<()>;

    /// Returns `false` when no log row exists for the provider message id.
    async fn update_delivery_status(&self, update: &DeliveryStatusUpdate) -> StoreResult<bool>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

const CONFIG_COLUMNS: &str = "id, user_id, access_token, phone_number_id, webhook_url, \
     verify_token, app_secret, is_active";
const CUSTOMER_COLUMNS: &str =
    "id, phone_number, name, last_user_message_time, ai_enabled, language";
const MESSAGE_COLUMNS: &str = "id, customer_id, message, direction, timestamp, is_read, \
     media_type, media_url, caption, provider_message_id";
const TEMPLATE_COLUMNS: &str = "id, agent_id, name, category, is_active, body";

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        info!("running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Creates the tenant tables if they do not exist yet.
    pub async fn provision_tenant_tables(&self, prefix: &TenantPrefix) -> StoreResult<()> {
        let tables = prefix.tables();
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id BIGSERIAL PRIMARY KEY, \
                 phone_number TEXT NOT NULL UNIQUE, \
                 name TEXT NOT NULL, \
                 last_user_message_time TIMESTAMPTZ, \
                 ai_enabled BOOLEAN NOT NULL DEFAULT TRUE, \
                 language TEXT, \
                 created_at TIMESTAMPTZ NOT NULL DEFAULT NOW())",
                tables.customers
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id BIGSERIAL PRIMARY KEY, \
                 customer_id BIGINT NOT NULL REFERENCES {}(id), \
                 message TEXT NOT NULL, \
                 direction TEXT NOT NULL CHECK (direction IN ('inbound', 'outbound')), \
                 timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
                 is_read BOOLEAN NOT NULL DEFAULT FALSE, \
                 media_type TEXT NOT NULL DEFAULT 'none', \
                 media_url TEXT, \
                 caption TEXT, \
                 provider_message_id TEXT)",
                tables.messages, tables.customers
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS \"{}_messages_customer_idx\" ON {} (customer_id, timestamp)",
                prefix, tables.messages
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id BIGSERIAL PRIMARY KEY, \
                 agent_id BIGINT NOT NULL REFERENCES agents(id), \
                 name TEXT NOT NULL, \
                 category TEXT NOT NULL DEFAULT 'utility', \
                 is_active BOOLEAN NOT NULL DEFAULT TRUE, \
                 body JSONB NOT NULL DEFAULT '{{}}'::jsonb, \
                 created_at TIMESTAMPTZ NOT NULL DEFAULT NOW())",
                tables.templates
            ),
        ];
        for statement in statements {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Provisions tenant tables for every agent with a valid prefix.
    pub async fn provision_all_tenants(&self) -> StoreResult<usize> {
        let prefixes = sqlx::query_scalar::<_, String>("SELECT prefix FROM agents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut provisioned = 0usize;
        for raw in prefixes {
            match TenantPrefix::parse(&raw) {
                Ok(prefix) => {
                    self.provision_tenant_tables(&prefix).await?;
                    provisioned += 1;
                }
                Err(err) => tracing::warn!(error = %err, "skipping agent with invalid prefix"),
            }
        }
        Ok(provisioned)
    }
}

fn parse_config_row(row: PgRow) -> WhatsAppConfiguration {
    WhatsAppConfiguration {
        id: row.get("id"),
        user_id: row.get("user_id"),
        access_token: row.get("access_token"),
        phone_number_id: row.get("phone_number_id"),
        webhook_url: row.get("webhook_url"),
        verify_token: row.get("verify_token"),
        app_secret: row.get("app_secret"),
        is_active: row.get("is_active"),
    }
}

fn parse_customer_row(row: PgRow) -> Customer {
    Customer {
        id: row.get("id"),
        phone_number: row.get("phone_number"),
        name: row.get("name"),
        last_user_message_time: row.get("last_user_message_time"),
        ai_enabled: row.get("ai_enabled"),
        language: row.get("language"),
    }
}

fn parse_message_row(row: PgRow) -> StoreResult<Message> {
    let corrupt = |detail: String| StoreError::Corrupt {
        entity: "message",
        detail,
    };
    Ok(Message {
        id: row.get("id"),
        customer_id: row.get("customer_id"),
        message: row.get("message"),
        direction: row.get::<String, _>("direction").parse().map_err(corrupt)?,
        timestamp: row.get("timestamp"),
        is_read: row.get("is_read"),
        media_type: row.get::<String, _>("media_type").parse().map_err(corrupt)?,
        media_url: row.get("media_url"),
        caption: row.get("caption"),
        provider_message_id: row.get("provider_message_id"),
    })
}

fn parse_template_row(row: PgRow) -> Template {
    Template {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        name: row.get("name"),
        category: row.get("category"),
        is_active: row.get("is_active"),
        body: row.get("body"),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_configuration_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> StoreResult<Option<WhatsAppConfiguration>> {
        let row = sqlx::query(&format!(
            "SELECT {CONFIG_COLUMNS} FROM whatsapp_configurations \
             WHERE phone_number_id = $1 AND is_active = true ORDER BY id ASC LIMIT 1"
        ))
        .bind(phone_number_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_config_row))
    }

    async fn find_active_configuration(
        &self,
        user_id: &str,
    ) -> StoreResult<Option<WhatsAppConfiguration>> {
        let row = sqlx::query(&format!(
            "SELECT {CONFIG_COLUMNS} FROM whatsapp_configurations \
             WHERE user_id = $1 AND is_active = true LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_config_row))
    }

    async fn find_agent_by_user_id(&self, user_id: &str) -> StoreResult<Option<Agent>> {
        let row = sqlx::query(
            "SELECT id, user_id, prefix, credits::float8 AS credits, business_type \
             FROM agents WHERE user_id = $1 LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Agent {
            id: row.get("id"),
            user_id: row.get("user_id"),
            prefix: row.get("prefix"),
            credits: row.get("credits"),
            business_type: row.get("business_type"),
        }))
    }

    async fn upsert_inbound_customer(
        &self,
        tables: &TenantTables,
        phone_number: &str,
        name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Customer> {
        let row = sqlx::query(&format!(
            "INSERT INTO {} (phone_number, name, last_user_message_time) VALUES ($1, $2, $3) \
             ON CONFLICT (phone_number) DO UPDATE \
             SET last_user_message_time = EXCLUDED.last_user_message_time \
             RETURNING {CUSTOMER_COLUMNS}",
            tables.customers
        ))
        .bind(phone_number)
        .bind(name)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(parse_customer_row(row))
    }

    async fn find_customer_by_phone(
        &self,
        tables: &TenantTables,
        phone_digits: &str,
    ) -> StoreResult<Option<Customer>> {
        let row = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM {} \
             WHERE regexp_replace(phone_number, '[^0-9]', '', 'g') = $1 \
             ORDER BY id ASC LIMIT 1",
            tables.customers
        ))
        .bind(phone_digits)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_customer_row))
    }

    async fn insert_message(
        &self,
        tables: &TenantTables,
        message: &NewMessage,
    ) -> StoreResult<Message> {
        let row = sqlx::query(&format!(
            "INSERT INTO {} \
             (customer_id, message, direction, timestamp, is_read, media_type, media_url, caption, provider_message_id) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) \
             RETURNING {MESSAGE_COLUMNS}",
            tables.messages
        ))
        .bind(message.customer_id)
        .bind(&message.message)
        .bind(message.direction.as_str())
        .bind(message.timestamp)
        .bind(message.is_read)
        .bind(message.media_type.as_str())
        .bind(&message.media_url)
        .bind(&message.caption)
        .bind(&message.provider_message_id)
        .fetch_one(&self.pool)
        .await?;
        parse_message_row(row)
    }

    async fn find_template_by_name(
        &self,
        tables: &TenantTables,
        agent_id: i64,
        name: &str,
    ) -> StoreResult<Option<Template>> {
        let row = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM {} \
             WHERE agent_id = $1 AND (name = $2 OR body->>'name' = $2) \
             ORDER BY is_active DESC, id ASC LIMIT 1",
            tables.templates
        ))
        .bind(agent_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_template_row))
    }

    async fn find_active_template_for_category(
        &self,
        tables: &TenantTables,
        agent_id: i64,
        category: Option<&str>,
    ) -> StoreResult<Option<Template>> {
        let row = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM {} \
             WHERE agent_id = $1 AND is_active = true \
               AND ($2::text IS NULL OR lower(category) = lower($2)) \
             ORDER BY id ASC LIMIT 1",
            tables.templates
        ))
        .bind(agent_id)
        .bind(category)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_template_row))
    }

    async fn debit_credits(&self, agent_id: i64, amount: f64) -> StoreResult<Option<f64>> {
        let balance = sqlx::query_scalar::<_, f64>(
            "UPDATE agents SET credits = credits - $1::numeric \
             WHERE id = $2 AND credits >= $1::numeric \
             RETURNING credits::float8",
        )
        .bind(amount)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(balance)
    }

    async fn current_credits(&self, agent_id: i64) -> StoreResult<Option<f64>> {
        let balance =
            sqlx::query_scalar::<_, f64>("SELECT credits::float8 FROM agents WHERE id = $1")
                .bind(agent_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance)
    }

    async fn refund_credits(&self, agent_id: i64, amount: f64) -> StoreResult<Option<f64>> {
        let balance = sqlx::query_scalar::<_, f64>(
            "UPDATE agents SET credits = credits + $1::numeric \
             WHERE id = $2 \
             RETURNING credits::float8",
        )
        .bind(amount)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(balance)
    }

    async fn record_delivery(&self, log: &DeliveryLog) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO whatsapp_delivery_logs \
             (provider_message_id, agent_id, customer_id, message_id, status, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,NOW(),NOW()) \
             ON CONFLICT (provider_message_id) DO NOTHING",
        )
        .bind(&log.provider_message_id)
        .bind(log.agent_id)
        .bind(log.customer_id)
        .bind(log.message_id)
        .bind(&log.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_delivery_status(&self, update: &DeliveryStatusUpdate) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE whatsapp_delivery_logs SET status = $1, error = $2, updated_at = $3 \
             WHERE provider_message_id = $4",
        )
        .bind(&update.status)
        .bind(&update.error)
        .bind(update.at)
        .bind(&update.provider_message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
