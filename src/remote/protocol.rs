//! Request/response messages and the policy dispatch table.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteError;

pub type PolicyError = Box<dyn std::error::Error + Send + Sync>;

/// Operations a remote policy accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Reset,
    SetLanguage,
    UpdateObs,
    GetAction,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Command::Reset,
        Command::SetLanguage,
        Command::UpdateObs,
        Command::GetAction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Reset => "reset",
            Command::SetLanguage => "set_language",
            Command::UpdateObs => "update_obs",
            Command::GetAction => "get_action",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| RemoteError::UnknownCommand(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub cmd: String,
    #[serde(default)]
    pub obs: Value,
}

impl Request {
    pub fn new(cmd: Command, obs: Value) -> Self {
        Self {
            cmd: cmd.as_str().to_string(),
            obs,
        }
    }

    pub fn command(&self) -> Result<Command, RemoteError> {
        self.cmd.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Error {
        error: String,
        #[serde(default)]
        traceback: String,
    },
    Ok {
        res: Value,
    },
}

impl Response {
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self {
            Response::Ok { res } => Ok(res),
            Response::Error { error, traceback } => Err(RemoteError::Server {
                message: error,
                traceback,
            }),
        }
    }
}

/// Model side of the transport. Observations and actions are JSON trees in which numeric
/// arrays are encoded tensors (see `codec::Tensor`).
pub trait Policy: Send {
    fn reset(&mut self) -> Result<Value, PolicyError>;

    fn set_language(&mut self, instruction: &str) -> Result<Value, PolicyError>;

    fn update_obs(&mut self, obs: Value) -> Result<Value, PolicyError>;

    fn get_action(&mut self, obs: Value) -> Result<Value, PolicyError>;
}

/// Routes one decoded request to `policy`.
pub fn dispatch<P: Policy + ?Sized>(policy: &mut P, cmd: Command, obs: Value) -> Result<Value, PolicyError> {
    match cmd {
        Command::Reset => policy.reset(),
        Command::SetLanguage => {
            let instruction = obs
                .as_str()
                .ok_or("set_language expects a string instruction")?;
            policy.set_language(instruction)
        }
        Command::UpdateObs => policy.update_obs(obs),
        Command::GetAction => policy.get_action(obs),
    }
}

/// Message plus the source chain, one cause per line.
pub fn traceback(error: &(dyn std::error::Error + 'static)) -> String {
    let mut lines = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    lines.join("\n")
}
