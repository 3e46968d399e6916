use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use imap_codec::imap_types::command::Command;
use imap_codec::imap_types::core::Tag;
use tokio::sync::watch;

use crate::imap::capability::ServerCapability;
use crate::imap::command::{anonymous, authenticated, selected};
use crate::imap::flow;
use crate::imap::request::Request;
use crate::imap::response::{Response, ResponseOrIdle};
use crate::Backend;

pub struct Instance {
    backend: Arc<Backend>,
    server_capabilities: ServerCapability,
    must_exit: watch::Receiver<bool>,
    auth_allowed: bool,
    pub state: flow::State,
}

impl Instance {
    pub fn new(
        backend: Arc<Backend>,
        cap: ServerCapability,
        must_exit: watch::Receiver<bool>,
        auth_allowed: bool,
    ) -> Self {
        Self {
            backend,
            server_capabilities: cap,
            must_exit,
            auth_allowed,
            state: flow::State::NotAuthenticated,
        }
    }

    pub async fn request(&mut self, req: Request) -> ResponseOrIdle {
        match req {
            Request::IdleStart(tag) => self.idle_init(tag),
            Request::IdlePoll => self.idle_poll().await,
            Request::ImapCommand(cmd) => self.command(cmd).await,
        }
    }

    fn idle_init(&mut self, tag: Tag<'static>) -> ResponseOrIdle {
        let transition = flow::Transition::Idle(tag.clone(), tokio::sync::Notify::new());
        let maybe_stop = self
            .state
            .apply(transition)
            .context("IDLE transition failed")
            .and_then(|_| {
                self.state
                    .notify()
                    .ok_or(anyhow!("IDLE state has no notifier"))
            });

        match maybe_stop {
            Ok(stop) => ResponseOrIdle::IdleAccept(stop),
            Err(e) => {
                tracing::error!(err = ?e, "unable to init idle due to a transition error");
                let no = Response::build()
                    .tag(tag)
                    .message("Internal error, IDLE not available here")
                    .no()
                    .unwrap();
                ResponseOrIdle::IdleReject(no)
            }
        }
    }

    async fn idle_poll(&mut self) -> ResponseOrIdle {
        match self.idle_poll_happy().await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(err = ?e, "something bad happened in idle");
                ResponseOrIdle::Response(Response::bye().unwrap())
            }
        }
    }

    async fn idle_poll_happy(&mut self) -> Result<ResponseOrIdle> {
        let (mailbox, tag, stop) = match &mut self.state {
            flow::State::Idle(_, ref mut mailbox, _, tag, stop) => {
                (mailbox, tag.clone(), stop.clone())
            }
            _ => bail!("invalid session state, can't idle"),
        };
        let mut must_exit = self.must_exit.clone();

        tokio::select! {
            _ = stop.notified() => {
                self.state.apply(flow::Transition::UnIdle)?;
                Ok(ResponseOrIdle::Response(
                    Response::build()
                        .tag(tag.clone())
                        .message("IDLE completed")
                        .ok()?,
                ))
            },
            _ = must_exit.changed() => {
                Ok(ResponseOrIdle::Response(Response::bye()?))
            },
            change = mailbox.idle_sync() => {
                tracing::debug!("idle event");
                Ok(ResponseOrIdle::IdleEvent(change?))
            }
        }
    }

    async fn command(&mut self, cmd: Command<'static>) -> ResponseOrIdle {
        // Command behavior is modulated by the state; to prevent state
        // errors, the same command is handled by separate code paths.
        let (resp, tr) = match &mut self.state {
            flow::State::NotAuthenticated => {
                let ctx = anonymous::AnonymousContext {
                    req: &cmd,
                    backend: &self.backend,
                    server_capabilities: &self.server_capabilities,
                    auth_allowed: self.auth_allowed,
                };
                anonymous::dispatch(ctx).await
            }
            flow::State::Authenticated(ref account) => {
                let ctx = authenticated::AuthenticatedContext {
                    req: &cmd,
                    backend: &self.backend,
                    account,
                    server_capabilities: &self.server_capabilities,
                    must_exit: &self.must_exit,
                };
                authenticated::dispatch(ctx).await
            }
            flow::State::Selected(ref account, ref mut mailbox, ref perm) => {
                let ctx = selected::SelectedContext {
                    req: &cmd,
                    backend: &self.backend,
                    account,
                    mailbox,
                    server_capabilities: &self.server_capabilities,
                    perm,
                    must_exit: &self.must_exit,
                };
                selected::dispatch(ctx).await
            }
            flow::State::Idle(..) => Err(anyhow!("can not receive command while idling")),
            flow::State::Logout => Response::build()
                .tag(cmd.tag.clone())
                .message("No commands are allowed in the LOGOUT state.")
                .bad()
                .map(|r| (r, flow::Transition::None)),
        }
        .unwrap_or_else(|err| {
            tracing::error!(err = ?err, cmd = ?cmd, "command error");
            (
                Response::build()
                    .to_req(&cmd)
                    .message("Internal error while processing command")
                    .bad()
                    .unwrap(),
                flow::Transition::None,
            )
        });

        if let Err(e) = self.state.apply(tr) {
            tracing::error!(err = ?e, cmd = ?cmd, "transition error");
            return ResponseOrIdle::Response(
                Response::build()
                    .to_req(&cmd)
                    .message("Internal error, command triggered an illegal IMAP state transition")
                    .bad()
                    .unwrap(),
            );
        }
        ResponseOrIdle::Response(resp)
    }
}
