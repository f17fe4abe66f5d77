use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use uuid::Uuid;

use shared::{
    domain::{ConversationId, ConversationKind, MessageId, MessageStatus, UserId},
    protocol::{ConversationRecord, MessageRecord, PollState, ServerEvent},
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Insert parameters for a new message row. Reads back as a full
/// [`MessageRecord`] after hydration.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub client_ref: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub status: MessageStatus,
    pub encryption_algorithm: Option<String>,
    pub signature: Option<String>,
    pub forwarded_from: Option<ConversationId>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub ephemeral_expires_at: Option<DateTime<Utc>>,
    pub poll: Option<(String, Vec<String>)>,
}

impl NewMessage {
    pub fn text(
        client_ref: Uuid,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            client_ref,
            conversation_id,
            sender_id,
            content: content.into(),
            status: MessageStatus::Sent,
            encryption_algorithm: None,
            signature: None,
            forwarded_from: None,
            scheduled_at: None,
            ephemeral_expires_at: None,
            poll: None,
        }
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS conversations (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                kind          TEXT NOT NULL,
                topic         TEXT NOT NULL DEFAULT '',
                owner_user_id INTEGER NOT NULL,
                created_at    TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS participants (
                conversation_id INTEGER NOT NULL,
                user_id         INTEGER NOT NULL,
                is_admin        INTEGER NOT NULL DEFAULT 0,
                position        INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            )",
            "CREATE TABLE IF NOT EXISTS messages (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                client_ref           TEXT NOT NULL UNIQUE,
                conversation_id      INTEGER NOT NULL,
                sender_id            INTEGER NOT NULL,
                content              TEXT NOT NULL,
                status               TEXT NOT NULL,
                created_at           TEXT NOT NULL,
                encryption_algorithm TEXT,
                signature            TEXT,
                edited_at            TEXT,
                deleted_at           TEXT,
                forwarded_from       INTEGER,
                scheduled_at         TEXT,
                ephemeral_expires_at TEXT,
                pinned               INTEGER NOT NULL DEFAULT 0,
                pinned_by            INTEGER,
                pinned_at            TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, id)",
            "CREATE TABLE IF NOT EXISTS message_reads (
                message_id INTEGER NOT NULL,
                user_id    INTEGER NOT NULL,
                read_at    TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id)
            )",
            "CREATE TABLE IF NOT EXISTS reactions (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL,
                emoji      TEXT NOT NULL,
                user_id    INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS polls (
                message_id INTEGER PRIMARY KEY,
                question   TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS poll_options (
                message_id INTEGER NOT NULL,
                idx        INTEGER NOT NULL,
                label      TEXT NOT NULL,
                votes      INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (message_id, idx)
            )",
            "CREATE TABLE IF NOT EXISTS poll_votes (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL,
                idx        INTEGER NOT NULL,
                voter_id   INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS reports (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                message_id      INTEGER NOT NULL,
                reporter_id     INTEGER NOT NULL,
                reason          TEXT NOT NULL,
                created_at      TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS applied_ops (
                client_ref TEXT PRIMARY KEY,
                event      TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to initialize schema")?;
        }
        Ok(())
    }

    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        topic: &str,
        owner: UserId,
        participants: &[UserId],
    ) -> Result<ConversationRecord> {
        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO conversations (kind, topic, owner_user_id, created_at)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(kind_str(kind))
        .bind(topic)
        .bind(owner.0)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;
        let conversation_id = ConversationId(rec.get::<i64, _>(0));

        for (position, user) in participants.iter().enumerate() {
            let is_admin = kind.has_admins() && *user == owner;
            sqlx::query(
                "INSERT INTO participants (conversation_id, user_id, is_admin, position)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(conversation_id, user_id) DO NOTHING",
            )
            .bind(conversation_id.0)
            .bind(user.0)
            .bind(is_admin)
            .bind(position as i64)
            .execute(&self.pool)
            .await?;
        }

        Ok(ConversationRecord {
            conversation_id,
            kind,
            topic: topic.to_string(),
            participants: participants.to_vec(),
            owner,
            admins: if kind.has_admins() { vec![owner] } else { Vec::new() },
            created_at,
        })
    }

    pub async fn conversation_exists(&self, conversation_id: ConversationId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationRecord>> {
        let Some(row) = sqlx::query(
            "SELECT kind, topic, owner_user_id, created_at FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let kind = parse_kind(&row.get::<String, _>("kind"))?;
        let members = sqlx::query(
            "SELECT user_id, is_admin FROM participants
             WHERE conversation_id = ? ORDER BY position",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut participants = Vec::with_capacity(members.len());
        let mut admins = Vec::new();
        for member in members {
            let user = UserId(member.get::<i64, _>("user_id"));
            participants.push(user);
            if member.get::<bool, _>("is_admin") {
                admins.push(user);
            }
        }

        Ok(Some(ConversationRecord {
            conversation_id,
            kind,
            topic: row.get::<String, _>("topic"),
            participants,
            owner: UserId(row.get::<i64, _>("owner_user_id")),
            admins,
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
        }))
    }

    pub async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ConversationRecord>> {
        let rows = sqlx::query(
            "SELECT conversation_id FROM participants WHERE user_id = ? ORDER BY conversation_id",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        let mut conversations = Vec::with_capacity(rows.len());
        for row in rows {
            let conversation_id = ConversationId(row.get::<i64, _>(0));
            if let Some(record) = self.load_conversation(conversation_id).await? {
                conversations.push(record);
            }
        }
        Ok(conversations)
    }

    /// Inserts a message, or returns the already-persisted row when the
    /// `client_ref` was seen before. The boolean is true only for a fresh
    /// insert, so replays never produce a duplicate effect.
    pub async fn insert_message(&self, new: NewMessage) -> Result<(MessageRecord, bool)> {
        if let Some(existing) = self.find_message_by_client_ref(new.client_ref).await? {
            return Ok((existing, false));
        }

        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (client_ref, conversation_id, sender_id, content, status,
                                   created_at, encryption_algorithm, signature, forwarded_from,
                                   scheduled_at, ephemeral_expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(new.client_ref.to_string())
        .bind(new.conversation_id.0)
        .bind(new.sender_id.0)
        .bind(&new.content)
        .bind(new.status.as_str())
        .bind(created_at)
        .bind(&new.encryption_algorithm)
        .bind(&new.signature)
        .bind(new.forwarded_from.map(|c| c.0))
        .bind(new.scheduled_at)
        .bind(new.ephemeral_expires_at)
        .fetch_one(&self.pool)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        if let Some((question, options)) = &new.poll {
            sqlx::query("INSERT INTO polls (message_id, question) VALUES (?, ?)")
                .bind(message_id.0)
                .bind(question)
                .execute(&self.pool)
                .await?;
            for (idx, label) in options.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO poll_options (message_id, idx, label, votes) VALUES (?, ?, ?, 0)",
                )
                .bind(message_id.0)
                .bind(idx as i64)
                .bind(label)
                .execute(&self.pool)
                .await?;
            }
        }

        let record = self
            .load_message(message_id)
            .await?
            .ok_or_else(|| anyhow!("message {} vanished after insert", message_id.0))?;
        Ok((record, true))
    }

    pub async fn find_message_by_client_ref(
        &self,
        client_ref: Uuid,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query("SELECT id FROM messages WHERE client_ref = ?")
            .bind(client_ref.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => self.load_message(MessageId(row.get::<i64, _>(0))).await,
            None => Ok(None),
        }
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<MessageRecord>> {
        let Some(row) = sqlx::query(
            "SELECT client_ref, conversation_id, sender_id, content, status, created_at,
                    encryption_algorithm, signature, edited_at, deleted_at, forwarded_from,
                    scheduled_at, ephemeral_expires_at, pinned, pinned_by, pinned_at
             FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let status_raw = row.get::<String, _>("status");
        let status = MessageStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown message status '{status_raw}'"))?;
        let client_ref = Uuid::parse_str(&row.get::<String, _>("client_ref"))
            .context("malformed client_ref column")?;

        let record = MessageRecord {
            message_id,
            client_ref,
            conversation_id: ConversationId(row.get::<i64, _>("conversation_id")),
            sender_id: UserId(row.get::<i64, _>("sender_id")),
            content: row.get::<String, _>("content"),
            status,
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            encryption_algorithm: row.get::<Option<String>, _>("encryption_algorithm"),
            signature: row.get::<Option<String>, _>("signature"),
            edited_at: row.get::<Option<DateTime<Utc>>, _>("edited_at"),
            deleted_at: row.get::<Option<DateTime<Utc>>, _>("deleted_at"),
            forwarded_from: row
                .get::<Option<i64>, _>("forwarded_from")
                .map(ConversationId),
            scheduled_at: row.get::<Option<DateTime<Utc>>, _>("scheduled_at"),
            ephemeral_expires_at: row.get::<Option<DateTime<Utc>>, _>("ephemeral_expires_at"),
            pinned: row.get::<bool, _>("pinned"),
            pinned_by: row.get::<Option<i64>, _>("pinned_by").map(UserId),
            pinned_at: row.get::<Option<DateTime<Utc>>, _>("pinned_at"),
            reactions: self.load_reactions(message_id).await?,
            poll: self.load_poll(message_id).await?,
        };
        Ok(Some(record))
    }

    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessageRecord>> {
        let rows = match before {
            Some(before) => {
                sqlx::query(
                    "SELECT id FROM messages WHERE conversation_id = ? AND id < ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(conversation_id.0)
                .bind(before.0)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id FROM messages WHERE conversation_id = ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(conversation_id.0)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            if let Some(record) = self.load_message(MessageId(row.get::<i64, _>(0))).await? {
                messages.push(record);
            }
        }
        Ok(messages)
    }

    async fn load_reactions(
        &self,
        message_id: MessageId,
    ) -> Result<BTreeMap<String, Vec<UserId>>> {
        let rows = sqlx::query(
            "SELECT emoji, user_id FROM reactions WHERE message_id = ? ORDER BY id",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        let mut reactions: BTreeMap<String, Vec<UserId>> = BTreeMap::new();
        for row in rows {
            reactions
                .entry(row.get::<String, _>("emoji"))
                .or_default()
                .push(UserId(row.get::<i64, _>("user_id")));
        }
        Ok(reactions)
    }

    async fn load_poll(&self, message_id: MessageId) -> Result<Option<PollState>> {
        let Some(poll) = sqlx::query("SELECT question FROM polls WHERE message_id = ?")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let rows = sqlx::query(
            "SELECT label, votes FROM poll_options WHERE message_id = ? ORDER BY idx",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        let mut options = Vec::with_capacity(rows.len());
        let mut votes = Vec::with_capacity(rows.len());
        for row in rows {
            options.push(row.get::<String, _>("label"));
            votes.push(row.get::<i64, _>("votes"));
        }
        Ok(Some(PollState {
            question: poll.get::<String, _>("question"),
            options,
            votes,
        }))
    }

    pub async fn edit_message(&self, message_id: MessageId, new_content: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET content = ?, edited_at = ? WHERE id = ?")
            .bind(new_content)
            .bind(Utc::now())
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Tombstone: the row keeps its identifier but loses its content.
    pub async fn tombstone_message(&self, message_id: MessageId) -> Result<()> {
        sqlx::query("UPDATE messages SET content = '', deleted_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_pinned(
        &self,
        message_id: MessageId,
        pin: bool,
        actor: UserId,
    ) -> Result<()> {
        if pin {
            sqlx::query("UPDATE messages SET pinned = 1, pinned_by = ?, pinned_at = ? WHERE id = ?")
                .bind(actor.0)
                .bind(Utc::now())
                .bind(message_id.0)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query(
                "UPDATE messages SET pinned = 0, pinned_by = NULL, pinned_at = NULL WHERE id = ?",
            )
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Appends without de-duplication: the same user reacting twice with one
    /// emoji is recorded twice (source behavior, kept deliberately).
    pub async fn add_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
        user_id: UserId,
    ) -> Result<BTreeMap<String, Vec<UserId>>> {
        sqlx::query(
            "INSERT INTO reactions (message_id, emoji, user_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(message_id.0)
        .bind(emoji)
        .bind(user_id.0)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.load_reactions(message_id).await
    }

    pub async fn mark_read(&self, message_id: MessageId, reader: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?)
             ON CONFLICT(message_id, user_id) DO NOTHING",
        )
        .bind(message_id.0)
        .bind(reader.0)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advances the status only along the one-way lifecycle; a regression or
    /// an advance past `Failed` leaves the row untouched and returns the
    /// status that is actually stored.
    pub async fn advance_status(
        &self,
        message_id: MessageId,
        next: MessageStatus,
    ) -> Result<MessageStatus> {
        let row = sqlx::query("SELECT status FROM messages WHERE id = ?")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("message {} not found", message_id.0))?;
        let current_raw = row.get::<String, _>("status");
        let current = MessageStatus::parse(&current_raw)
            .ok_or_else(|| anyhow!("unknown message status '{current_raw}'"))?;

        if !current.can_transition_to(next) {
            return Ok(current);
        }
        sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(next.as_str())
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(next)
    }

    /// Single-statement increment; concurrent voters can never lose an
    /// update the way a read-modify-write would. Each accepted vote also
    /// records who cast it. Returns the full vote array, or None when the
    /// option index is out of range.
    pub async fn vote_poll(
        &self,
        message_id: MessageId,
        option_index: u32,
        voter: UserId,
    ) -> Result<Option<Vec<i64>>> {
        let updated = sqlx::query(
            "UPDATE poll_options SET votes = votes + 1 WHERE message_id = ? AND idx = ?",
        )
        .bind(message_id.0)
        .bind(option_index as i64)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        sqlx::query(
            "INSERT INTO poll_votes (message_id, idx, voter_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(message_id.0)
        .bind(option_index as i64)
        .bind(voter.0)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        let poll = self
            .load_poll(message_id)
            .await?
            .ok_or_else(|| anyhow!("poll options exist without a poll row"))?;
        Ok(Some(poll.votes))
    }

    pub async fn poll_voters(&self, message_id: MessageId) -> Result<Vec<(u32, UserId)>> {
        let rows = sqlx::query(
            "SELECT idx, voter_id FROM poll_votes WHERE message_id = ? ORDER BY id",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<i64, _>("idx") as u32,
                    UserId(row.get::<i64, _>("voter_id")),
                )
            })
            .collect())
    }

    pub async fn has_poll(&self, message_id: MessageId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM polls WHERE message_id = ?")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Ledger of non-message operations keyed by their client reference. A
    /// replayed `client_ref` finds the event recorded by the first
    /// application, so votes, reactions, reports, and conversation creation
    /// never apply twice.
    pub async fn find_applied_op(&self, client_ref: Uuid) -> Result<Option<ServerEvent>> {
        let row = sqlx::query("SELECT event FROM applied_ops WHERE client_ref = ?")
            .bind(client_ref.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let event = serde_json::from_str(&row.get::<String, _>("event"))
                    .context("malformed applied_ops event column")?;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    pub async fn record_applied_op(&self, client_ref: Uuid, event: &ServerEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO applied_ops (client_ref, event, applied_at) VALUES (?, ?, ?)
             ON CONFLICT(client_ref) DO NOTHING",
        )
        .bind(client_ref.to_string())
        .bind(serde_json::to_string(event)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_report(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        reporter_id: UserId,
        reason: &str,
    ) -> Result<i64> {
        let rec = sqlx::query(
            "INSERT INTO reports (conversation_id, message_id, reporter_id, reason, created_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(conversation_id.0)
        .bind(message_id.0)
        .bind(reporter_id.0)
        .bind(reason)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(rec.get::<i64, _>(0))
    }
}

fn kind_str(kind: ConversationKind) -> &'static str {
    match kind {
        ConversationKind::Direct => "direct",
        ConversationKind::Group => "group",
        ConversationKind::Channel => "channel",
    }
}

fn parse_kind(raw: &str) -> Result<ConversationKind> {
    match raw {
        "direct" => Ok(ConversationKind::Direct),
        "group" => Ok(ConversationKind::Group),
        "channel" => Ok(ConversationKind::Channel),
        other => Err(anyhow!("unknown conversation kind '{other}'")),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
