//! Blocking client for a remote policy.

use std::{net::TcpStream, thread};

use log::{info, warn};
use serde_json::Value;

use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::remote::codec::{recv_json, send_json};
use crate::remote::protocol::{Command, Request, Response};

pub struct PolicyClient {
    stream: TcpStream,
    addr: String,
}

impl PolicyClient {
    /// Connects with up to `connect_attempts` tries, `retry_delay` apart.
    pub fn connect(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let attempts = config.connect_attempts.max(1);
        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            match TcpStream::connect(&config.addr) {
                Ok(stream) => break stream,
                Err(source) if attempt >= attempts => {
                    return Err(RemoteError::Connect {
                        addr: config.addr.clone(),
                        attempts,
                        source,
                    });
                }
                Err(e) => {
                    warn!(
                        "[PolicyClient] connect to {} failed ({}/{}): {}",
                        config.addr, attempt, attempts, e
                    );
                    thread::sleep(config.retry_delay());
                }
            }
        };
        let timeout = Some(config.timeout()).filter(|t| !t.is_zero());
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        stream.set_nodelay(true)?;
        info!("[PolicyClient] connected to {}", config.addr);
        Ok(Self {
            stream,
            addr: config.addr.clone(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one command and waits for its reply.
    pub fn call(&mut self, cmd: Command, obs: Value) -> Result<Value, RemoteError> {
        send_json(&mut self.stream, &Request::new(cmd, obs))?;
        let response: Response = recv_json(&mut self.stream)?;
        response.into_result()
    }

    pub fn reset(&mut self) -> Result<Value, RemoteError> {
        self.call(Command::Reset, Value::Null)
    }

    pub fn set_language(&mut self, instruction: &str) -> Result<Value, RemoteError> {
        self.call(Command::SetLanguage, Value::from(instruction))
    }

    pub fn update_obs(&mut self, obs: Value) -> Result<Value, RemoteError> {
        self.call(Command::UpdateObs, obs)
    }

    pub fn get_action(&mut self, obs: Value) -> Result<Value, RemoteError> {
        self.call(Command::GetAction, obs)
    }
}
