use bytes::Bytes;

/// A single client request: the command name as sent and its arguments in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    name: String,
    args: Vec<Bytes>,
}

impl Request {
    pub fn new(name: impl Into<String>, args: Vec<Bytes>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn into_parts(self) -> (String, Vec<Bytes>) {
        (self.name, self.args)
    }
}
