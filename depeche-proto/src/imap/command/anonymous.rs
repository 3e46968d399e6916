use std::sync::Arc;

use anyhow::Result;
use imap_codec::imap_types::command::{Command, CommandBody};
use imap_codec::imap_types::core::AString;
use imap_codec::imap_types::secret::Secret;

use depeche_user::error::Error;

use crate::imap::capability::ServerCapability;
use crate::imap::command::{anystate, astring_text, error_code};
use crate::imap::flow;
use crate::imap::response::Response;
use crate::Backend;

pub struct AnonymousContext<'a> {
    pub req: &'a Command<'static>,
    pub backend: &'a Arc<Backend>,
    pub server_capabilities: &'a ServerCapability,
    pub auth_allowed: bool,
}

pub async fn dispatch(ctx: AnonymousContext<'_>) -> Result<(Response<'static>, flow::Transition)> {
    match &ctx.req.body {
        // Any State
        CommandBody::Noop => anystate::noop_nothing(ctx.req.tag.clone()),
        CommandBody::Capability => anystate::capability(ctx.req.tag.clone(), ctx.server_capabilities),
        CommandBody::Logout => anystate::logout(),

        // Specific to the anonymous state (3 commands)
        CommandBody::Login { username, password } => ctx.login(username, password).await,
        CommandBody::Authenticate { .. } => {
            // RFC 3501 requires LOGINDISABLED to be the only reason to
            // reject LOGIN; we accept LOGIN and keep AUTHENTICATE minimal.
            Ok((
                Response::build()
                    .to_req(ctx.req)
                    .message("AUTHENTICATE is not available, use LOGIN")
                    .no()?,
                flow::Transition::None,
            ))
        }
        CommandBody::StartTLS => Ok((
            Response::build()
                .to_req(ctx.req)
                .message("STARTTLS is not available, connect with implicit TLS")
                .no()?,
            flow::Transition::None,
        )),

        // Collect other commands
        _ => anystate::wrong_state(ctx.req.tag.clone()),
    }
}

impl<'a> AnonymousContext<'a> {
    async fn login(
        self,
        username: &AString<'a>,
        password: &Secret<AString<'a>>,
    ) -> Result<(Response<'static>, flow::Transition)> {
        if !self.auth_allowed {
            return Ok((
                Response::build()
                    .to_req(self.req)
                    .message("Plaintext authentication is disabled on this listener")
                    .no()?,
                flow::Transition::None,
            ));
        }

        let (u, p) = (astring_text(username), astring_text(password.declassify()));
        tracing::info!(user = %u, "command.login");

        let account = match self.backend.login(&u, &p).await {
            Err(e) => {
                tracing::debug!(user = %u, err = %e, "authentication failed");
                let mut resp = Response::build()
                    .to_req(self.req)
                    .message("Authentication failed");
                if let Some(code) = error_code(&Error::AuthFailed) {
                    resp = resp.code(code);
                }
                return Ok((resp.no()?, flow::Transition::None));
            }
            Ok(account) => account,
        };

        tracing::info!(username = %account.address, "connected");
        Ok((
            Response::build()
                .to_req(self.req)
                .message("Completed")
                .ok()?,
            flow::Transition::Authenticate(account),
        ))
    }
}
