pub mod imap;
pub mod lmtp;
pub mod managesieve;
pub mod pop3;
pub mod tls;

use std::sync::Arc;

use depeche_mail::bodies::Bodies;
use depeche_mail::ingest::Ingestor;
use depeche_meta::model::AccountId;
use depeche_meta::MetaStore;
use depeche_user::config::ServersConfig;
use depeche_user::error::{Error, Result};
use depeche_user::login::LoginName;

/// Everything a protocol session needs to do its work.
pub struct Backend {
    pub meta: Arc<MetaStore>,
    pub bodies: Arc<Bodies>,
    pub ingest: Arc<Ingestor>,
    pub servers: ServersConfig,
    pub insecure_auth: bool,
}

/// An authenticated account, as seen by a session.
#[derive(Clone, Debug)]
pub struct Account {
    pub id: AccountId,
    pub address: String,
}

impl Backend {
    /// Shared authentication for all four protocols: Dovecot-style master
    /// proxy first, password check otherwise, default mailboxes provisioned
    /// on the way in.
    pub async fn login(&self, username: &str, password: &str) -> Result<Account> {
        let name = LoginName::parse(username);

        let id = if name.proxy_user.is_some() {
            if !name.is_master_login(&self.servers, password) {
                return Err(Error::AuthFailed);
            }
            self.meta
                .get_account_id_by_address(name.address)
                .await
                .map_err(|_| Error::AuthFailed)?
        } else {
            self.meta.authenticate(name.address, password).await?
        };

        self.meta.create_default_mailboxes(id).await?;
        Ok(Account {
            id,
            address: name.address.to_string(),
        })
    }
}
