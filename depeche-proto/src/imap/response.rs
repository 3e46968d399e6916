use anyhow::Result;
use imap_codec::imap_types::command::Command;
use imap_codec::imap_types::core::Tag;
use imap_codec::imap_types::response::{Code, Data, Status, StatusKind};
use tokio::sync::Notify;

#[derive(Debug)]
pub enum Body<'a> {
    Data(Data<'a>),
    Status(Status<'a>),
}

#[derive(Debug, Default)]
pub struct ResponseBuilder<'a> {
    tag: Option<Tag<'a>>,
    code: Option<Code<'a>>,
    text: String,
    body: Vec<Body<'a>>,
}

impl<'a> ResponseBuilder<'a> {
    pub fn to_req(mut self, cmd: &Command<'a>) -> Self {
        self.tag = Some(cmd.tag.clone());
        self
    }

    pub fn tag(mut self, tag: Tag<'a>) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn message(mut self, txt: impl Into<String>) -> Self {
        self.text = txt.into();
        self
    }

    pub fn code(mut self, code: Code<'a>) -> Self {
        self.code = Some(code);
        self
    }

    pub fn data(mut self, data: Data<'a>) -> Self {
        self.body.push(Body::Data(data));
        self
    }

    pub fn set_body(mut self, body: Vec<Body<'a>>) -> Self {
        self.body = body;
        self
    }

    fn complete(self, kind: StatusKind) -> Result<Response<'a>> {
        Ok(Response {
            completion: Status::new(self.tag, kind, self.code, self.text)?,
            body: self.body,
        })
    }

    pub fn ok(self) -> Result<Response<'a>> {
        self.complete(StatusKind::Ok)
    }

    pub fn no(self) -> Result<Response<'a>> {
        self.complete(StatusKind::No)
    }

    pub fn bad(self) -> Result<Response<'a>> {
        self.complete(StatusKind::Bad)
    }
}

#[derive(Debug)]
pub struct Response<'a> {
    pub body: Vec<Body<'a>>,
    pub completion: Status<'a>,
}

impl<'a> Response<'a> {
    pub fn build() -> ResponseBuilder<'a> {
        ResponseBuilder::default()
    }

    pub fn bye() -> Result<Response<'a>> {
        Ok(Response {
            completion: Status::bye(None, "bye")?,
            body: vec![],
        })
    }
}

pub enum ResponseOrIdle {
    Response(Response<'static>),
    IdleAccept(std::sync::Arc<Notify>),
    IdleReject(Response<'static>),
    IdleEvent(Vec<Body<'static>>),
}
