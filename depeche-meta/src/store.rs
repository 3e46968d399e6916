use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use depeche_user::blob::BlobId;
use depeche_user::config::DatabaseConfig;
use depeche_user::error::{Error, Result};
use depeche_user::login::verify_password;

use crate::model::*;
use crate::search::{Criterion, SqlParams};
use crate::tls::MakeRustlsConnect;

const SCHEMA: &str = include_str!("schema.sql");

/// Advisory lock key for the cluster-wide cleanup singleton.
const CLEANUP_LOCK_KEY: i64 = 0x6465_7065_6368_6501;

/// The authoritative catalog: accounts, mailboxes, messages, flags,
/// envelopes, body structures, recipients, the pending-upload queue and the
/// cleanup bookkeeping, all in PostgreSQL.
///
/// Every mutating operation runs in a transaction; per-mailbox modseqs are
/// advanced with `UPDATE ... RETURNING` inside the same transaction as the
/// message mutation they describe.
pub struct MetaStore {
    pool: Pool,
    pg: tokio_postgres::Config,
    use_tls: bool,
    log_queries: bool,
}

/// What STORE should do with the given flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagOp {
    Add,
    Remove,
    Set,
}

/// Flag rewrite applied to copies landing in a destination mailbox
/// (move-to-Trash marks the copies `\Seen`).
#[derive(Clone, Copy, Debug, Default)]
pub struct FlagRewrite {
    pub clear_bits: i32,
    pub set_bits: i32,
}

impl FlagRewrite {
    pub fn trash() -> Self {
        Self {
            clear_bits: 0,
            set_bits: flag_bits::SEEN,
        }
    }

    fn apply(&self, bits: i32) -> i32 {
        (bits & !self.clear_bits) | self.set_bits
    }
}

impl MetaStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .user(&config.user)
            .password(&config.password)
            .dbname(&config.name)
            .application_name("depeche");

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = if config.tls {
            Manager::from_config(pg.clone(), MakeRustlsConnect::system()?, mgr_config)
        } else {
            Manager::from_config(pg.clone(), NoTls, mgr_config)
        };
        let pool = Pool::builder(mgr)
            .max_size(16)
            .build()
            .map_err(|e| Error::internal(format!("database pool: {}", e)))?;

        let store = Self {
            pool,
            pg,
            use_tls: config.tls,
            log_queries: config.log_queries,
        };

        // Fail fast when the database is unreachable.
        let client = store.client().await?;
        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| Error::internal(format!("schema bootstrap: {}", e)))?;

        Ok(store)
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::transient(format!("database: {}", e)))
    }

    fn trace(&self, what: &str) {
        if self.log_queries {
            tracing::debug!(query = what, "sql");
        }
    }

    // ---- accounts ----

    pub async fn create_account(&self, address: &str, password_hash: &str) -> Result<AccountId> {
        self.trace("create_account");
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO accounts (address, password_hash) VALUES (lower($1), $2) \
                 RETURNING account_id",
                &[&address, &password_hash],
            )
            .await
            .map_err(|e| db_err(e, || format!("account {}", address)))?;
        Ok(row.get(0))
    }

    pub async fn delete_account(&self, address: &str) -> Result<()> {
        self.trace("delete_account");
        let client = self.client().await?;
        let n = client
            .execute(
                "DELETE FROM accounts WHERE lower(address) = lower($1)",
                &[&address],
            )
            .await
            .map_err(|e| db_err(e, || format!("account {}", address)))?;
        if n == 0 {
            return Err(Error::not_found(format!("account {}", address)));
        }
        Ok(())
    }

    pub async fn set_password(&self, address: &str, password_hash: &str) -> Result<()> {
        self.trace("set_password");
        let client = self.client().await?;
        let n = client
            .execute(
                "UPDATE accounts SET password_hash = $2 WHERE lower(address) = lower($1)",
                &[&address, &password_hash],
            )
            .await
            .map_err(|e| db_err(e, || format!("account {}", address)))?;
        if n == 0 {
            return Err(Error::not_found(format!("account {}", address)));
        }
        Ok(())
    }

    pub async fn get_account_id_by_address(&self, address: &str) -> Result<AccountId> {
        self.trace("get_account_id_by_address");
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT account_id FROM accounts WHERE lower(address) = lower($1)",
                &[&address],
            )
            .await
            .map_err(|e| db_err(e, || format!("account {}", address)))?;
        row.map(|r| r.get(0))
            .ok_or_else(|| Error::not_found(format!("account {}", address)))
    }

    /// Check a password and return the account id. Master-proxy logins are
    /// resolved by the caller before this point.
    pub async fn authenticate(&self, address: &str, password: &str) -> Result<AccountId> {
        self.trace("authenticate");
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT account_id, password_hash FROM accounts WHERE lower(address) = lower($1)",
                &[&address],
            )
            .await
            .map_err(|e| db_err(e, || format!("account {}", address)))?;

        let (account_id, hash): (AccountId, String) = match row {
            Some(r) => (r.get(0), r.get(1)),
            None => return Err(Error::AuthFailed),
        };
        match verify_password(password, &hash) {
            Ok(true) => Ok(account_id),
            _ => Err(Error::AuthFailed),
        }
    }

    /// Resolve an account id without password check, for master-proxy logins
    /// and LMTP recipient resolution.
    pub async fn account_for_delivery(&self, address: &str) -> Result<AccountId> {
        self.get_account_id_by_address(address).await
    }

    // ---- mailboxes ----

    /// Create the six default mailboxes if they are missing. Idempotent;
    /// runs at every login.
    pub async fn create_default_mailboxes(&self, account_id: AccountId) -> Result<()> {
        self.trace("create_default_mailboxes");
        let client = self.client().await?;
        for name in DEFAULT_MAILBOXES {
            client
                .execute(
                    "INSERT INTO mailboxes (account_id, name, uid_validity) \
                     VALUES ($1, $2, nextval('uidvalidity_seq')) \
                     ON CONFLICT (account_id, lower(name)) DO NOTHING",
                    &[&account_id, &name],
                )
                .await
                .map_err(|e| db_err(e, || format!("mailbox {}", name)))?;
        }
        Ok(())
    }

    /// Create a mailbox, including any missing ancestors of a hierarchical
    /// name.
    pub async fn create_mailbox(&self, account_id: AccountId, name: &str) -> Result<MailboxId> {
        self.trace("create_mailbox");
        let name = normalize_mailbox_name(name)?;

        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| db_err(e, || "transaction".into()))?;

        let mut parent_id: Option<MailboxId> = None;
        let mut created_leaf = false;
        let mut leaf_id: MailboxId = 0;
        let mut path = String::new();
        for segment in name.split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(segment);

            let existing = tx
                .query_opt(
                    "SELECT mailbox_id FROM mailboxes \
                     WHERE account_id = $1 AND lower(name) = lower($2)",
                    &[&account_id, &path],
                )
                .await
                .map_err(|e| db_err(e, || format!("mailbox {}", path)))?;
            match existing {
                Some(row) => {
                    leaf_id = row.get(0);
                    created_leaf = false;
                }
                None => {
                    let row = tx
                        .query_one(
                            "INSERT INTO mailboxes (account_id, name, parent_id, uid_validity) \
                             VALUES ($1, $2, $3, nextval('uidvalidity_seq')) \
                             RETURNING mailbox_id",
                            &[&account_id, &path, &parent_id],
                        )
                        .await
                        .map_err(|e| db_err(e, || format!("mailbox {}", path)))?;
                    leaf_id = row.get(0);
                    created_leaf = true;
                }
            }
            parent_id = Some(leaf_id);
        }

        if !created_leaf {
            return Err(Error::already_exists(format!("mailbox {}", name)));
        }
        tx.commit()
            .await
            .map_err(|e| db_err(e, || "commit".into()))?;
        Ok(leaf_id)
    }

    pub async fn rename_mailbox(&self, account_id: AccountId, from: &str, to: &str) -> Result<()> {
        self.trace("rename_mailbox");
        let from = normalize_mailbox_name(from)?;
        let to = normalize_mailbox_name(to)?;
        if is_default_mailbox(&from) {
            return Err(Error::permission(format!("cannot rename {}", from)));
        }

        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| db_err(e, || "transaction".into()))?;

        let row = tx
            .query_opt(
                "SELECT mailbox_id FROM mailboxes \
                 WHERE account_id = $1 AND lower(name) = lower($2)",
                &[&account_id, &from],
            )
            .await
            .map_err(|e| db_err(e, || format!("mailbox {}", from)))?;
        let mailbox_id: MailboxId = row
            .map(|r| r.get(0))
            .ok_or_else(|| Error::not_found(format!("mailbox {}", from)))?;

        let clash = tx
            .query_opt(
                "SELECT 1 FROM mailboxes WHERE account_id = $1 AND lower(name) = lower($2)",
                &[&account_id, &to],
            )
            .await
            .map_err(|e| db_err(e, || format!("mailbox {}", to)))?;
        if clash.is_some() {
            return Err(Error::already_exists(format!("mailbox {}", to)));
        }

        tx.execute(
            "UPDATE mailboxes SET name = $3 WHERE mailbox_id = $2 AND account_id = $1",
            &[&account_id, &mailbox_id, &to],
        )
        .await
        .map_err(|e| db_err(e, || format!("mailbox {}", to)))?;

        // Children keep following their parent: rewrite the name prefix.
        let like = format!("{}/%", escape_like(&from));
        let prefix_len = (from.len() as i32) + 1;
        tx.execute(
            "UPDATE mailboxes SET name = $3 || '/' || substr(name, $4) \
             WHERE account_id = $1 AND lower(name) LIKE lower($2)",
            &[&account_id, &like, &to, &(prefix_len + 1)],
        )
        .await
        .map_err(|e| db_err(e, || format!("mailbox {}", to)))?;

        tx.commit()
            .await
            .map_err(|e| db_err(e, || "commit".into()))?;
        Ok(())
    }

    /// Delete a mailbox and everything below it. Default mailboxes are
    /// protected.
    pub async fn delete_mailbox(&self, account_id: AccountId, name: &str) -> Result<()> {
        self.trace("delete_mailbox");
        let name = normalize_mailbox_name(name)?;
        if is_default_mailbox(&name) {
            return Err(Error::permission(format!("cannot delete {}", name)));
        }

        let client = self.client().await?;
        let like = format!("{}/%", escape_like(&name));
        let n = client
            .execute(
                "DELETE FROM mailboxes WHERE account_id = $1 \
                 AND (lower(name) = lower($2) OR lower(name) LIKE lower($3))",
                &[&account_id, &name, &like],
            )
            .await
            .map_err(|e| db_err(e, || format!("mailbox {}", name)))?;
        if n == 0 {
            return Err(Error::not_found(format!("mailbox {}", name)));
        }
        Ok(())
    }

    pub async fn list_mailboxes(&self, account_id: AccountId) -> Result<Vec<MailboxRow>> {
        self.trace("list_mailboxes");
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT mailbox_id, account_id, name, parent_id, uid_validity, subscribed \
                 FROM mailboxes WHERE account_id = $1 ORDER BY name",
                &[&account_id],
            )
            .await
            .map_err(|e| db_err(e, || "mailboxes".into()))?;
        Ok(rows.iter().map(mailbox_row).collect())
    }

    pub async fn get_mailbox_by_name(
        &self,
        account_id: AccountId,
        name: &str,
    ) -> Result<MailboxRow> {
        self.trace("get_mailbox_by_name");
        let name = normalize_mailbox_name(name)?;
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT mailbox_id, account_id, name, parent_id, uid_validity, subscribed \
                 FROM mailboxes WHERE account_id = $1 AND lower(name) = lower($2)",
                &[&account_id, &name],
            )
            .await
            .map_err(|e| db_err(e, || format!("mailbox {}", name)))?;
        row.as_ref()
            .map(mailbox_row)
            .ok_or_else(|| Error::not_found(format!("mailbox {}", name)))
    }

    pub async fn set_subscribed(
        &self,
        account_id: AccountId,
        name: &str,
        subscribed: bool,
    ) -> Result<()> {
        self.trace("set_subscribed");
        let name = normalize_mailbox_name(name)?;
        let client = self.client().await?;
        let n = client
            .execute(
                "UPDATE mailboxes SET subscribed = $3 \
                 WHERE account_id = $1 AND lower(name) = lower($2)",
                &[&account_id, &name, &subscribed],
            )
            .await
            .map_err(|e| db_err(e, || format!("mailbox {}", name)))?;
        if n == 0 {
            return Err(Error::not_found(format!("mailbox {}", name)));
        }
        Ok(())
    }

    pub async fn get_summary(&self, mailbox_id: MailboxId) -> Result<MailboxSummary> {
        self.trace("get_summary");
        let client = self.client().await?;
        let sql = format!(
            "SELECT \
             (SELECT COUNT(*) FROM messages WHERE mailbox_id = $1 AND expunged_modseq IS NULL), \
             (SELECT COUNT(*) FROM messages WHERE mailbox_id = $1 AND expunged_modseq IS NULL AND flag_bits & {recent} <> 0), \
             (SELECT COUNT(*) FROM messages WHERE mailbox_id = $1 AND expunged_modseq IS NULL AND flag_bits & {seen} = 0), \
             (SELECT MIN(uid) FROM messages WHERE mailbox_id = $1 AND expunged_modseq IS NULL AND flag_bits & {seen} = 0), \
             mb.uid_next, mb.uid_validity, mb.highest_modseq \
             FROM mailboxes mb WHERE mb.mailbox_id = $1",
            recent = flag_bits::RECENT,
            seen = flag_bits::SEEN,
        );
        let row = client
            .query_opt(&sql, &[&mailbox_id])
            .await
            .map_err(|e| db_err(e, || "summary".into()))?
            .ok_or_else(|| Error::not_found(format!("mailbox #{}", mailbox_id)))?;

        Ok(MailboxSummary {
            num_messages: row.get::<_, i64>(0) as u32,
            recent: row.get::<_, i64>(1) as u32,
            unseen: row.get::<_, i64>(2) as u32,
            first_unseen: row.get::<_, Option<i64>>(3).map(|v| v as u32),
            uid_next: row.get::<_, i64>(4) as u32,
            uid_validity: row.get::<_, i64>(5) as u32,
            highest_modseq: row.get(6),
        })
    }

    /// Drop `\Recent` from every message of the mailbox. Called when a
    /// session selects it read-write; does not advance the modseq since
    /// `\Recent` is session-volatile by definition.
    pub async fn clear_recent(&self, mailbox_id: MailboxId) -> Result<()> {
        self.trace("clear_recent");
        let client = self.client().await?;
        let sql = format!(
            "UPDATE messages SET flag_bits = flag_bits & ~{recent} \
             WHERE mailbox_id = $1 AND expunged_modseq IS NULL AND flag_bits & {recent} <> 0",
            recent = flag_bits::RECENT
        );
        client
            .execute(&sql, &[&mailbox_id])
            .await
            .map_err(|e| db_err(e, || "clear_recent".into()))?;
        Ok(())
    }

    /// Live (uid, flags) pairs in UID order, the session tracker's initial
    /// snapshot.
    pub async fn list_message_index(&self, mailbox_id: MailboxId) -> Result<Vec<(u32, FlagSet)>> {
        self.trace("list_message_index");
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT uid, flag_bits, custom_flags FROM messages \
                 WHERE mailbox_id = $1 AND expunged_modseq IS NULL ORDER BY uid",
                &[&mailbox_id],
            )
            .await
            .map_err(|e| db_err(e, || "message index".into()))?;
        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get::<_, i64>(0) as u32,
                    FlagSet {
                        bits: r.get(1),
                        custom: r.get(2),
                    },
                )
            })
            .collect())
    }

    // ---- messages ----

    /// Insert a message: allocate UID and modseq, record metadata, invoke
    /// the body callback once to persist the body durably, and track a
    /// pending upload when the callback staged it locally. The whole
    /// operation commits atomically; the callback's side effect is the
    /// durability point for the body.
    pub async fn insert_message<F, Fut>(&self, msg: &NewMessage, persist: F) -> Result<(u32, ModSeq)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BodyLocation>>,
    {
        self.trace("insert_message");
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| db_err(e, || "transaction".into()))?;

        let row = tx
            .query_opt(
                "SELECT uid_next, highest_modseq FROM mailboxes WHERE mailbox_id = $1 FOR UPDATE",
                &[&msg.mailbox_id],
            )
            .await
            .map_err(|e| db_err(e, || "uid allocation".into()))?
            .ok_or_else(|| Error::not_found(format!("mailbox #{}", msg.mailbox_id)))?;
        let uid: i64 = row.get(0);
        let modseq: i64 = row.get::<_, i64>(1) + 1;

        tx.execute(
            "UPDATE mailboxes SET uid_next = $2, highest_modseq = $3 WHERE mailbox_id = $1",
            &[&msg.mailbox_id, &(uid + 1), &modseq],
        )
        .await
        .map_err(|e| db_err(e, || "uid allocation".into()))?;

        let envelope = rmp_serde::to_vec(&msg.envelope)
            .map_err(|e| Error::internal(format!("envelope encode: {}", e)))?;
        let structure = rmp_serde::to_vec(&msg.body_structure)
            .map_err(|e| Error::internal(format!("structure encode: {}", e)))?;

        let flags = msg.flags.bits | flag_bits::RECENT;
        let blob = msg.blob.to_string();
        let row = tx
            .query_one(
                "INSERT INTO messages (mailbox_id, uid, content_hash, flag_bits, custom_flags, \
                 internal_date, sent_date, size, subject, message_id_header, in_reply_to, \
                 envelope, body_structure, plaintext_body, created_modseq, updated_modseq) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15) \
                 RETURNING message_id",
                &[
                    &msg.mailbox_id,
                    &uid,
                    &blob,
                    &flags,
                    &msg.flags.custom,
                    &msg.internal_date,
                    &msg.sent_date,
                    &(msg.size as i64),
                    &msg.subject,
                    &msg.message_id_header,
                    &msg.in_reply_to,
                    &envelope,
                    &structure,
                    &msg.plaintext_body,
                    &modseq,
                ],
            )
            .await
            .map_err(|e| db_err(e, || "message".into()))?;
        let message_id: MessageId = row.get(0);

        for r in &msg.recipients {
            tx.execute(
                "INSERT INTO message_recipients (message_id, kind, address, display_name) \
                 VALUES ($1, $2, $3, $4)",
                &[&message_id, &(r.kind as i16), &r.address, &r.name],
            )
            .await
            .map_err(|e| db_err(e, || "recipients".into()))?;
        }

        // Body durability happens here, inside the metadata transaction.
        match persist().await? {
            BodyLocation::Staged { path } => {
                let staging_path = path.to_string_lossy().to_string();
                tx.execute(
                    "INSERT INTO pending_uploads (message_id, content_hash, staging_path, size) \
                     VALUES ($1, $2, $3, $4)",
                    &[&message_id, &blob, &staging_path, &(msg.size as i64)],
                )
                .await
                .map_err(|e| db_err(e, || "pending upload".into()))?;
            }
            BodyLocation::Stored => {
                tx.execute(
                    "UPDATE messages SET uploaded = TRUE WHERE message_id = $1",
                    &[&message_id],
                )
                .await
                .map_err(|e| db_err(e, || "message".into()))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| db_err(e, || "commit".into()))?;
        Ok((uid as u32, modseq))
    }

    /// Copy messages into another mailbox; bodies are shared by content
    /// hash, fresh UIDs are allocated in the destination and both mailboxes'
    /// modseqs advance. Returns the destination uidvalidity and the
    /// src-uid → dst-uid mapping in source order.
    pub async fn copy_messages(
        &self,
        src_mailbox: MailboxId,
        uids: &[u32],
        dst_mailbox: MailboxId,
        rewrite: FlagRewrite,
    ) -> Result<(u32, Vec<(u32, u32)>)> {
        self.trace("copy_messages");
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| db_err(e, || "transaction".into()))?;
        let (dst_validity, mapping) =
            copy_in_tx(&tx, src_mailbox, uids, dst_mailbox, rewrite, false).await?;
        tx.commit()
            .await
            .map_err(|e| db_err(e, || "commit".into()))?;
        Ok((dst_validity, mapping))
    }

    /// Copy + expunge-at-source in one transaction.
    pub async fn move_messages(
        &self,
        src_mailbox: MailboxId,
        uids: &[u32],
        dst_mailbox: MailboxId,
        rewrite: FlagRewrite,
    ) -> Result<(u32, Vec<(u32, u32)>)> {
        self.trace("move_messages");
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| db_err(e, || "transaction".into()))?;
        let (dst_validity, mapping) =
            copy_in_tx(&tx, src_mailbox, uids, dst_mailbox, rewrite, true).await?;
        tx.commit()
            .await
            .map_err(|e| db_err(e, || "commit".into()))?;
        Ok((dst_validity, mapping))
    }

    /// Apply a flag mutation to each named live message. Returns
    /// (uid, new flags, new modseq) for every message that was updated;
    /// UIDs that vanished under a concurrent expunge are skipped.
    pub async fn update_flags(
        &self,
        mailbox_id: MailboxId,
        uids: &[u32],
        op: FlagOp,
        flags: &FlagSet,
    ) -> Result<Vec<(u32, FlagSet, ModSeq)>> {
        self.trace("update_flags");
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| db_err(e, || "transaction".into()))?;

        let mut out = Vec::with_capacity(uids.len());
        for &uid in uids {
            let row = tx
                .query_opt(
                    "SELECT flag_bits, custom_flags FROM messages \
                     WHERE mailbox_id = $1 AND uid = $2 AND expunged_modseq IS NULL FOR UPDATE",
                    &[&mailbox_id, &(uid as i64)],
                )
                .await
                .map_err(|e| db_err(e, || "flags".into()))?;
            let current = match row {
                Some(r) => FlagSet {
                    bits: r.get(0),
                    custom: r.get(1),
                },
                None => continue,
            };

            let new = match op {
                FlagOp::Add => current.union(flags),
                FlagOp::Remove => current.difference(flags),
                FlagOp::Set => FlagSet {
                    // \Recent is not client-controlled; preserve it.
                    bits: flags.bits | (current.bits & flag_bits::RECENT),
                    custom: flags.custom.clone(),
                },
            };

            let modseq = bump_modseq(&tx, mailbox_id).await?;
            tx.execute(
                "UPDATE messages SET flag_bits = $3, custom_flags = $4, updated_modseq = $5 \
                 WHERE mailbox_id = $1 AND uid = $2",
                &[&mailbox_id, &(uid as i64), &new.bits, &new.custom, &modseq],
            )
            .await
            .map_err(|e| db_err(e, || "flags".into()))?;
            out.push((uid, new, modseq));
        }

        tx.commit()
            .await
            .map_err(|e| db_err(e, || "commit".into()))?;
        Ok(out)
    }

    /// Mark the given messages expunged. The IMAP layer above decides
    /// whether this is a real expunge or the tail of a move-to-Trash.
    pub async fn expunge(&self, mailbox_id: MailboxId, uids: &[u32]) -> Result<Vec<u32>> {
        self.trace("expunge");
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| db_err(e, || "transaction".into()))?;
        let gone = expunge_in_tx(&tx, mailbox_id, uids).await?;
        tx.commit()
            .await
            .map_err(|e| db_err(e, || "commit".into()))?;
        Ok(gone)
    }

    /// All changes with a modseq strictly greater than `since`, plus the
    /// current live count and highest modseq. Sequence numbers are assigned
    /// by the caller's session tracker.
    pub async fn poll(&self, mailbox_id: MailboxId, since: ModSeq) -> Result<PollResult> {
        self.trace("poll");
        let client = self.client().await?;

        let head = client
            .query_opt(
                "SELECT highest_modseq, \
                 (SELECT COUNT(*) FROM messages WHERE mailbox_id = $1 AND expunged_modseq IS NULL) \
                 FROM mailboxes WHERE mailbox_id = $1",
                &[&mailbox_id],
            )
            .await
            .map_err(|e| db_err(e, || "poll".into()))?
            .ok_or_else(|| Error::not_found(format!("mailbox #{}", mailbox_id)))?;
        let highest_modseq: ModSeq = head.get(0);
        let num_messages = head.get::<_, i64>(1) as u32;

        if highest_modseq <= since {
            return Ok(PollResult {
                num_messages,
                highest_modseq,
                updates: Vec::new(),
            });
        }

        let rows = client
            .query(
                "SELECT uid, flag_bits, custom_flags, (expunged_modseq IS NOT NULL), \
                 GREATEST(updated_modseq, COALESCE(expunged_modseq, 0)) AS change_modseq \
                 FROM messages \
                 WHERE mailbox_id = $1 \
                 AND GREATEST(created_modseq, updated_modseq, COALESCE(expunged_modseq, 0)) > $2 \
                 ORDER BY change_modseq, uid",
                &[&mailbox_id, &since],
            )
            .await
            .map_err(|e| db_err(e, || "poll".into()))?;

        let updates = rows
            .iter()
            .map(|r| PollUpdate {
                uid: r.get::<_, i64>(0) as u32,
                flags: FlagSet {
                    bits: r.get(1),
                    custom: r.get(2),
                },
                is_expunge: r.get(3),
                modseq: r.get(4),
            })
            .collect();

        Ok(PollResult {
            num_messages,
            highest_modseq,
            updates,
        })
    }

    pub async fn get_messages_by_uids(
        &self,
        mailbox_id: MailboxId,
        uids: &[u32],
    ) -> Result<Vec<MessageRow>> {
        self.trace("get_messages_by_uids");
        let client = self.client().await?;
        let uids: Vec<i64> = uids.iter().map(|&u| u as i64).collect();
        let rows = client
            .query(
                "SELECT message_id, mailbox_id, uid, content_hash, flag_bits, custom_flags, \
                 internal_date, sent_date, size, subject, message_id_header, uploaded, \
                 updated_modseq \
                 FROM messages \
                 WHERE mailbox_id = $1 AND uid = ANY($2) AND expunged_modseq IS NULL \
                 ORDER BY uid",
                &[&mailbox_id, &uids],
            )
            .await
            .map_err(|e| db_err(e, || "messages".into()))?;
        rows.iter().map(message_row).collect()
    }

    pub async fn get_envelope(&self, mailbox_id: MailboxId, uid: u32) -> Result<Envelope> {
        self.trace("get_envelope");
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT envelope FROM messages \
                 WHERE mailbox_id = $1 AND uid = $2 AND expunged_modseq IS NULL",
                &[&mailbox_id, &(uid as i64)],
            )
            .await
            .map_err(|e| db_err(e, || "envelope".into()))?
            .ok_or_else(|| Error::not_found(format!("message {}", uid)))?;
        rmp_serde::from_slice(row.get::<_, &[u8]>(0))
            .map_err(|e| Error::internal(format!("envelope decode: {}", e)))
    }

    pub async fn get_body_structure(
        &self,
        mailbox_id: MailboxId,
        uid: u32,
    ) -> Result<BodyStructure> {
        self.trace("get_body_structure");
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT body_structure FROM messages \
                 WHERE mailbox_id = $1 AND uid = $2 AND expunged_modseq IS NULL",
                &[&mailbox_id, &(uid as i64)],
            )
            .await
            .map_err(|e| db_err(e, || "body structure".into()))?
            .ok_or_else(|| Error::not_found(format!("message {}", uid)))?;
        rmp_serde::from_slice(row.get::<_, &[u8]>(0))
            .map_err(|e| Error::internal(format!("structure decode: {}", e)))
    }

    /// Where the body bytes can be found: the content hash, plus the staging
    /// path while the upload has not completed yet.
    pub async fn get_body_ref(
        &self,
        mailbox_id: MailboxId,
        uid: u32,
    ) -> Result<(BlobId, Option<PathBuf>)> {
        self.trace("get_body_ref");
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT m.content_hash, \
                 (SELECT pu.staging_path FROM pending_uploads pu \
                  WHERE pu.content_hash = m.content_hash LIMIT 1) \
                 FROM messages m \
                 WHERE m.mailbox_id = $1 AND m.uid = $2 AND m.expunged_modseq IS NULL",
                &[&mailbox_id, &(uid as i64)],
            )
            .await
            .map_err(|e| db_err(e, || "body ref".into()))?
            .ok_or_else(|| Error::not_found(format!("message {}", uid)))?;

        let blob = parse_blob(row.get(0))?;
        let staging: Option<String> = row.get(1);
        Ok((blob, staging.map(PathBuf::from)))
    }

    pub async fn get_messages_by_flag(&self, mailbox_id: MailboxId, bit: i32) -> Result<Vec<u32>> {
        self.trace("get_messages_by_flag");
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT uid FROM messages \
                 WHERE mailbox_id = $1 AND expunged_modseq IS NULL AND flag_bits & $2 <> 0 \
                 ORDER BY uid",
                &[&mailbox_id, &bit],
            )
            .await
            .map_err(|e| db_err(e, || "messages".into()))?;
        Ok(rows.iter().map(|r| r.get::<_, i64>(0) as u32).collect())
    }

    pub async fn search(
        &self,
        mailbox_id: MailboxId,
        criterion: &Criterion,
    ) -> Result<Vec<(u32, ModSeq)>> {
        self.trace("search");
        let mut p = SqlParams::new(1);
        let cond = criterion.to_sql(&mut p);
        let sql = format!(
            "SELECT m.uid, m.updated_modseq FROM messages m \
             WHERE m.mailbox_id = $1 AND m.expunged_modseq IS NULL AND {} ORDER BY m.uid",
            cond
        );

        let client = self.client().await?;
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(p.values.len() + 1);
        params.push(&mailbox_id);
        for v in &p.values {
            params.push(v);
        }
        let rows = client
            .query(&sql, &params)
            .await
            .map_err(|e| db_err(e, || "search".into()))?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<_, i64>(0) as u32, r.get::<_, i64>(1)))
            .collect())
    }

    // ---- upload queue ----

    /// Pending uploads ready for an attempt: linear backoff
    /// (`attempts × backoff`) filtered in the query, insertion order, at
    /// most `limit` rows, rows at the attempt cap excluded.
    pub async fn list_pending_uploads(
        &self,
        limit: usize,
        backoff: Duration,
        max_attempts: u32,
    ) -> Result<Vec<PendingUpload>> {
        self.trace("list_pending_uploads");
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT upload_id, message_id, content_hash, staging_path, size, attempts \
                 FROM pending_uploads \
                 WHERE attempts < $1 \
                 AND (last_attempt_at IS NULL \
                      OR last_attempt_at + ($2 * attempts) * interval '1 second' <= now()) \
                 ORDER BY upload_id \
                 LIMIT $3",
                &[
                    &(max_attempts as i32),
                    &backoff.as_secs_f64(),
                    &(limit as i64),
                ],
            )
            .await
            .map_err(|e| db_err(e, || "pending uploads".into()))?;

        rows.iter()
            .map(|r| {
                Ok(PendingUpload {
                    upload_id: r.get(0),
                    message_id: r.get(1),
                    blob: parse_blob(r.get(2))?,
                    staging_path: PathBuf::from(r.get::<_, String>(3)),
                    size: r.get::<_, i64>(4) as u64,
                    attempts: r.get(5),
                })
            })
            .collect()
    }

    /// Record the outcome of an attempt. Failures bump the counter and the
    /// timestamp; the new counter is returned so the worker can log when the
    /// cap is reached.
    pub async fn mark_upload_attempt(&self, upload_id: UploadId, success: bool) -> Result<i32> {
        self.trace("mark_upload_attempt");
        if success {
            return Ok(0);
        }
        let client = self.client().await?;
        let row = client
            .query_opt(
                "UPDATE pending_uploads SET attempts = attempts + 1, last_attempt_at = now() \
                 WHERE upload_id = $1 RETURNING attempts",
                &[&upload_id],
            )
            .await
            .map_err(|e| db_err(e, || "upload attempt".into()))?;
        Ok(row.map(|r| r.get(0)).unwrap_or(0))
    }

    /// The single commit point of an upload: flip `uploaded` for every
    /// message sharing the blob and drop the queue row, atomically. A
    /// missing row means a previous attempt already committed; that is a
    /// success (restart safety).
    pub async fn complete_upload(&self, _message_id: MessageId, upload_id: UploadId) -> Result<()> {
        self.trace("complete_upload");
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| db_err(e, || "transaction".into()))?;

        let row = tx
            .query_opt(
                "SELECT content_hash FROM pending_uploads WHERE upload_id = $1 FOR UPDATE",
                &[&upload_id],
            )
            .await
            .map_err(|e| db_err(e, || "complete upload".into()))?;
        let hash: String = match row {
            Some(r) => r.get(0),
            None => return Ok(()),
        };

        tx.execute(
            "UPDATE messages SET uploaded = TRUE WHERE content_hash = $1",
            &[&hash],
        )
        .await
        .map_err(|e| db_err(e, || "complete upload".into()))?;
        tx.execute(
            "DELETE FROM pending_uploads WHERE upload_id = $1",
            &[&upload_id],
        )
        .await
        .map_err(|e| db_err(e, || "complete upload".into()))?;

        tx.commit()
            .await
            .map_err(|e| db_err(e, || "commit".into()))?;
        Ok(())
    }

    // ---- cleanup support ----

    /// Try to become the cluster-wide cleanup singleton. The advisory lock
    /// lives on a dedicated connection, so dropping the guard (even on a
    /// panic path) closes the session and releases the lock.
    pub async fn try_cleanup_lock(&self) -> Result<Option<CleanupLock>> {
        self.trace("try_cleanup_lock");
        let client = self.dedicated_client().await?;
        let row = client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&CLEANUP_LOCK_KEY])
            .await
            .map_err(|e| db_err(e, || "advisory lock".into()))?;
        if row.get::<_, bool>(0) {
            Ok(Some(CleanupLock { client }))
        } else {
            Ok(None)
        }
    }

    async fn dedicated_client(&self) -> Result<tokio_postgres::Client> {
        if self.use_tls {
            let tls = MakeRustlsConnect::system()?;
            let (client, conn) = self
                .pg
                .connect(tls)
                .await
                .map_err(|e| db_err(e, || "connect".into()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!(err = %e, "dedicated database connection closed");
                }
            });
            Ok(client)
        } else {
            let (client, conn) = self
                .pg
                .connect(NoTls)
                .await
                .map_err(|e| db_err(e, || "connect".into()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!(err = %e, "dedicated database connection closed");
                }
            });
            Ok(client)
        }
    }

    /// Forget vacation auto-response records older than the grace period.
    pub async fn prune_vacation_responses(&self, grace: Duration) -> Result<u64> {
        self.trace("prune_vacation_responses");
        let client = self.client().await?;
        client
            .execute(
                "DELETE FROM vacation_responses \
                 WHERE responded_at < now() - ($1 * interval '1 second')",
                &[&grace.as_secs_f64()],
            )
            .await
            .map_err(|e| db_err(e, || "vacation responses".into()))
    }

    /// Remember that an auto-response went out to `sender`, so the next one
    /// is suppressed until the record is pruned.
    pub async fn record_vacation_response(
        &self,
        account_id: AccountId,
        sender: &str,
    ) -> Result<()> {
        self.trace("record_vacation_response");
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO vacation_responses (account_id, sender) VALUES ($1, $2)",
                &[&account_id, &sender],
            )
            .await
            .map_err(|e| db_err(e, || "vacation responses".into()))?;
        Ok(())
    }

    /// Content hashes whose references are all expunged, none pending
    /// upload, and whose last reference died before the grace period began.
    pub async fn cleanup_candidates(&self, grace: Duration, limit: usize) -> Result<Vec<BlobId>> {
        self.trace("cleanup_candidates");
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT m.content_hash FROM messages m \
                 GROUP BY m.content_hash \
                 HAVING bool_and(m.expunged_modseq IS NOT NULL) \
                 AND max(m.expunged_at) < now() - ($1 * interval '1 second') \
                 AND NOT EXISTS (SELECT 1 FROM pending_uploads pu \
                                 WHERE pu.content_hash = m.content_hash) \
                 LIMIT $2",
                &[&grace.as_secs_f64(), &(limit as i64)],
            )
            .await
            .map_err(|e| db_err(e, || "cleanup candidates".into()))?;
        rows.iter().map(|r| parse_blob(r.get(0))).collect()
    }

    /// Remove the metadata rows of all expunged messages with this hash.
    /// Only called after the blob is confirmed gone from the object store.
    pub async fn delete_expunged_messages_by_content_hash(&self, blob: &BlobId) -> Result<u64> {
        self.trace("delete_expunged_messages_by_content_hash");
        let client = self.client().await?;
        client
            .execute(
                "DELETE FROM messages \
                 WHERE content_hash = $1 AND expunged_modseq IS NOT NULL",
                &[&blob.to_string()],
            )
            .await
            .map_err(|e| db_err(e, || "expunged messages".into()))
    }

    /// Of the candidate hashes, which are still referenced by a live
    /// message or a pending upload. Used by the cache orphan purge.
    pub async fn find_existing_content_hashes(
        &self,
        candidates: &[BlobId],
    ) -> Result<HashSet<BlobId>> {
        self.trace("find_existing_content_hashes");
        let client = self.client().await?;
        let hashes: Vec<String> = candidates.iter().map(|b| b.to_string()).collect();
        let rows = client
            .query(
                "SELECT DISTINCT content_hash FROM messages \
                 WHERE content_hash = ANY($1) AND expunged_modseq IS NULL \
                 UNION \
                 SELECT content_hash FROM pending_uploads WHERE content_hash = ANY($1)",
                &[&hashes],
            )
            .await
            .map_err(|e| db_err(e, || "content hashes".into()))?;
        rows.iter().map(|r| parse_blob(r.get(0))).collect()
    }

    // ---- sieve scripts ----

    pub async fn list_sieve_scripts(&self, account_id: AccountId) -> Result<Vec<SieveScript>> {
        self.trace("list_sieve_scripts");
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT name, content, active FROM sieve_scripts \
                 WHERE account_id = $1 ORDER BY name",
                &[&account_id],
            )
            .await
            .map_err(|e| db_err(e, || "sieve scripts".into()))?;
        Ok(rows
            .iter()
            .map(|r| SieveScript {
                name: r.get(0),
                content: r.get(1),
                active: r.get(2),
            })
            .collect())
    }

    pub async fn get_sieve_script(&self, account_id: AccountId, name: &str) -> Result<SieveScript> {
        self.trace("get_sieve_script");
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT name, content, active FROM sieve_scripts \
                 WHERE account_id = $1 AND name = $2",
                &[&account_id, &name],
            )
            .await
            .map_err(|e| db_err(e, || format!("script {}", name)))?
            .ok_or_else(|| Error::not_found(format!("script {}", name)))?;
        Ok(SieveScript {
            name: row.get(0),
            content: row.get(1),
            active: row.get(2),
        })
    }

    pub async fn put_sieve_script(
        &self,
        account_id: AccountId,
        name: &str,
        content: &str,
    ) -> Result<()> {
        self.trace("put_sieve_script");
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO sieve_scripts (account_id, name, content) VALUES ($1, $2, $3) \
                 ON CONFLICT (account_id, name) DO UPDATE SET content = EXCLUDED.content",
                &[&account_id, &name, &content],
            )
            .await
            .map_err(|e| db_err(e, || format!("script {}", name)))?;
        Ok(())
    }

    pub async fn delete_sieve_script(&self, account_id: AccountId, name: &str) -> Result<()> {
        self.trace("delete_sieve_script");
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT active FROM sieve_scripts WHERE account_id = $1 AND name = $2",
                &[&account_id, &name],
            )
            .await
            .map_err(|e| db_err(e, || format!("script {}", name)))?
            .ok_or_else(|| Error::not_found(format!("script {}", name)))?;
        if row.get::<_, bool>(0) {
            return Err(Error::permission("cannot delete the active script"));
        }
        client
            .execute(
                "DELETE FROM sieve_scripts WHERE account_id = $1 AND name = $2",
                &[&account_id, &name],
            )
            .await
            .map_err(|e| db_err(e, || format!("script {}", name)))?;
        Ok(())
    }

    /// Make `name` the active script, or deactivate all when `None`.
    pub async fn set_active_sieve_script(
        &self,
        account_id: AccountId,
        name: Option<&str>,
    ) -> Result<()> {
        self.trace("set_active_sieve_script");
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| db_err(e, || "transaction".into()))?;
        tx.execute(
            "UPDATE sieve_scripts SET active = FALSE WHERE account_id = $1",
            &[&account_id],
        )
        .await
        .map_err(|e| db_err(e, || "sieve scripts".into()))?;
        if let Some(name) = name {
            let n = tx
                .execute(
                    "UPDATE sieve_scripts SET active = TRUE \
                     WHERE account_id = $1 AND name = $2",
                    &[&account_id, &name],
                )
                .await
                .map_err(|e| db_err(e, || format!("script {}", name)))?;
            if n == 0 {
                return Err(Error::not_found(format!("script {}", name)));
            }
        }
        tx.commit()
            .await
            .map_err(|e| db_err(e, || "commit".into()))?;
        Ok(())
    }
}

/// Holder of the cluster-wide cleanup advisory lock. Dropping it closes the
/// dedicated session, which releases the lock server-side.
pub struct CleanupLock {
    client: tokio_postgres::Client,
}

impl CleanupLock {
    pub async fn release(self) {
        if let Err(e) = self
            .client
            .execute("SELECT pg_advisory_unlock($1)", &[&CLEANUP_LOCK_KEY])
            .await
        {
            tracing::warn!(err = %e, "cleanup lock release failed, dropping session instead");
        }
    }
}

// ---- shared transaction helpers ----

async fn bump_modseq(tx: &tokio_postgres::Transaction<'_>, mailbox_id: MailboxId) -> Result<ModSeq> {
    let row = tx
        .query_one(
            "UPDATE mailboxes SET highest_modseq = highest_modseq + 1 \
             WHERE mailbox_id = $1 RETURNING highest_modseq",
            &[&mailbox_id],
        )
        .await
        .map_err(|e| db_err(e, || "modseq".into()))?;
    Ok(row.get(0))
}

async fn expunge_in_tx(
    tx: &tokio_postgres::Transaction<'_>,
    mailbox_id: MailboxId,
    uids: &[u32],
) -> Result<Vec<u32>> {
    let mut gone = Vec::with_capacity(uids.len());
    for &uid in uids {
        let live = tx
            .query_opt(
                "SELECT 1 FROM messages \
                 WHERE mailbox_id = $1 AND uid = $2 AND expunged_modseq IS NULL FOR UPDATE",
                &[&mailbox_id, &(uid as i64)],
            )
            .await
            .map_err(|e| db_err(e, || "expunge".into()))?;
        if live.is_none() {
            continue;
        }
        let modseq = bump_modseq(tx, mailbox_id).await?;
        tx.execute(
            "UPDATE messages SET expunged_modseq = $3, expunged_at = now() \
             WHERE mailbox_id = $1 AND uid = $2",
            &[&mailbox_id, &(uid as i64), &modseq],
        )
        .await
        .map_err(|e| db_err(e, || "expunge".into()))?;
        gone.push(uid);
    }
    Ok(gone)
}

async fn copy_in_tx(
    tx: &tokio_postgres::Transaction<'_>,
    src_mailbox: MailboxId,
    uids: &[u32],
    dst_mailbox: MailboxId,
    rewrite: FlagRewrite,
    expunge_source: bool,
) -> Result<(u32, Vec<(u32, u32)>)> {
    // Lock mailbox rows in id order so concurrent copies in both
    // directions cannot deadlock.
    let mut lock_order = vec![src_mailbox, dst_mailbox];
    lock_order.sort();
    lock_order.dedup();
    for id in lock_order {
        tx.execute(
            "SELECT 1 FROM mailboxes WHERE mailbox_id = $1 FOR UPDATE",
            &[&id],
        )
        .await
        .map_err(|e| db_err(e, || "mailbox lock".into()))?;
    }

    let dst = tx
        .query_opt(
            "SELECT uid_next, highest_modseq, uid_validity FROM mailboxes WHERE mailbox_id = $1",
            &[&dst_mailbox],
        )
        .await
        .map_err(|e| db_err(e, || "destination mailbox".into()))?
        .ok_or_else(|| Error::not_found(format!("mailbox #{}", dst_mailbox)))?;
    let mut next_uid: i64 = dst.get(0);
    let mut dst_modseq: i64 = dst.get(1);
    let dst_validity = dst.get::<_, i64>(2) as u32;

    let mut mapping = Vec::with_capacity(uids.len());
    let mut copied_src_uids = Vec::with_capacity(uids.len());
    for &uid in uids {
        let row = tx
            .query_opt(
                "SELECT message_id, content_hash, flag_bits, custom_flags, internal_date, \
                 sent_date, size, subject, message_id_header, in_reply_to, envelope, \
                 body_structure, plaintext_body, uploaded \
                 FROM messages \
                 WHERE mailbox_id = $1 AND uid = $2 AND expunged_modseq IS NULL",
                &[&src_mailbox, &(uid as i64)],
            )
            .await
            .map_err(|e| db_err(e, || "source message".into()))?;
        let row = match row {
            Some(r) => r,
            None => continue,
        };

        dst_modseq += 1;
        let src_message_id: MessageId = row.get(0);
        let flags = rewrite.apply(row.get::<_, i32>(2)) | flag_bits::RECENT;
        let inserted = tx
            .query_one(
                "INSERT INTO messages (mailbox_id, uid, content_hash, flag_bits, custom_flags, \
                 internal_date, sent_date, size, subject, message_id_header, in_reply_to, \
                 envelope, body_structure, plaintext_body, created_modseq, updated_modseq, \
                 uploaded) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15, \
                 $16) \
                 RETURNING message_id",
                &[
                    &dst_mailbox,
                    &next_uid,
                    &row.get::<_, String>(1),
                    &flags,
                    &row.get::<_, Vec<String>>(3),
                    &row.get::<_, DateTime<Utc>>(4),
                    &row.get::<_, Option<DateTime<Utc>>>(5),
                    &row.get::<_, i64>(6),
                    &row.get::<_, String>(7),
                    &row.get::<_, Option<String>>(8),
                    &row.get::<_, Vec<String>>(9),
                    &row.get::<_, &[u8]>(10),
                    &row.get::<_, &[u8]>(11),
                    &row.get::<_, Option<String>>(12),
                    &dst_modseq,
                    &row.get::<_, bool>(13),
                ],
            )
            .await
            .map_err(|e| db_err(e, || "destination message".into()))?;
        let dst_message_id: MessageId = inserted.get(0);

        tx.execute(
            "INSERT INTO message_recipients (message_id, kind, address, display_name) \
             SELECT $1, kind, address, display_name FROM message_recipients \
             WHERE message_id = $2",
            &[&dst_message_id, &src_message_id],
        )
        .await
        .map_err(|e| db_err(e, || "recipients".into()))?;

        mapping.push((uid, next_uid as u32));
        copied_src_uids.push(uid);
        next_uid += 1;
    }

    tx.execute(
        "UPDATE mailboxes SET uid_next = $2, highest_modseq = $3 WHERE mailbox_id = $1",
        &[&dst_mailbox, &next_uid, &dst_modseq],
    )
    .await
    .map_err(|e| db_err(e, || "destination mailbox".into()))?;

    if expunge_source {
        expunge_in_tx(tx, src_mailbox, &copied_src_uids).await?;
    } else {
        // Both mailboxes advance their modseq, even though a plain copy
        // leaves the source rows untouched.
        bump_modseq(tx, src_mailbox).await?;
    }

    Ok((dst_validity, mapping))
}

// ---- row decoding ----

fn mailbox_row(row: &Row) -> MailboxRow {
    MailboxRow {
        mailbox_id: row.get(0),
        account_id: row.get(1),
        name: row.get(2),
        parent_id: row.get(3),
        uid_validity: row.get::<_, i64>(4) as u32,
        subscribed: row.get(5),
    }
}

fn message_row(row: &Row) -> Result<MessageRow> {
    Ok(MessageRow {
        message_id: row.get(0),
        mailbox_id: row.get(1),
        uid: row.get::<_, i64>(2) as u32,
        blob: parse_blob(row.get(3))?,
        flags: FlagSet {
            bits: row.get(4),
            custom: row.get(5),
        },
        internal_date: row.get(6),
        sent_date: row.get(7),
        size: row.get::<_, i64>(8) as u64,
        subject: row.get(9),
        message_id_header: row.get(10),
        uploaded: row.get(11),
        modseq: row.get(12),
    })
}

fn parse_blob(raw: &str) -> Result<BlobId> {
    raw.parse()
        .map_err(|_| Error::internal(format!("bad content hash in database: {}", raw)))
}

fn normalize_mailbox_name(name: &str) -> Result<String> {
    let name = name.trim_matches('/');
    if name.is_empty() || name.split('/').any(|seg| seg.is_empty()) {
        return Err(Error::malformed("empty mailbox name"));
    }
    // The canonical INBOX spelling, whatever the client sent.
    if name.eq_ignore_ascii_case(INBOX) {
        return Ok(INBOX.to_string());
    }
    Ok(name.to_string())
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn db_err(e: tokio_postgres::Error, what: impl FnOnce() -> String) -> Error {
    if let Some(code) = e.code() {
        if *code == SqlState::UNIQUE_VIOLATION {
            return Error::already_exists(what());
        }
    }
    if e.is_closed() || e.as_db_error().is_none() {
        return Error::transient(format!("database: {}", e));
    }
    Error::internal(format!("database: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_rewrite_for_trash() {
        let rw = FlagRewrite::trash();
        let bits = flag_bits::DELETED | flag_bits::ANSWERED;
        let out = rw.apply(bits);
        // \Deleted survives the move, \Seen is added.
        assert_ne!(out & flag_bits::DELETED, 0);
        assert_ne!(out & flag_bits::SEEN, 0);
        assert_ne!(out & flag_bits::ANSWERED, 0);
    }

    #[test]
    fn mailbox_name_normalization() {
        assert_eq!(normalize_mailbox_name("inbox").unwrap(), "INBOX");
        assert_eq!(normalize_mailbox_name("Work/2024/").unwrap(), "Work/2024");
        assert!(normalize_mailbox_name("").is_err());
        assert!(normalize_mailbox_name("a//b").is_err());
    }

    #[test]
    fn like_escaping() {
        assert_eq!(escape_like("a_b%c"), "a\\_b\\%c");
    }
}
