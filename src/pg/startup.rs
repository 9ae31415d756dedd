//! TCP connect and the startup/authentication handshake.
//!
//! The handshake runs before the connection actor exists, so it reads and
//! writes the socket directly and returns everything the actor needs.

use std::collections::HashMap;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::auth::{md5_password, ScramClient, SCRAM_SHA_256};
use super::config::PgConfig;
use super::error::{PgError, PgResult};
use super::protocol::*;

/// An authenticated socket that has seen its first `ReadyForQuery`.
pub(crate) struct Session {
    pub stream: TcpStream,
    /// Bytes read past the first `ReadyForQuery`
    pub read_buf: BytesMut,
    pub parameters: HashMap<String, String>,
    pub process_id: i32,
    pub secret_key: i32,
}

/// Connect and authenticate, bounded by `config.connect_timeout`.
pub(crate) async fn establish(config: &PgConfig) -> PgResult<Session> {
    tokio::time::timeout(config.connect_timeout, handshake(config))
        .await
        .map_err(|_| PgError::Timeout)?
}

async fn handshake(config: &PgConfig) -> PgResult<Session> {
    let stream = TcpStream::connect(config.addr()).await?;
    stream.set_nodelay(true)?;

    let mut startup = Startup {
        stream,
        read_buf: BytesMut::with_capacity(8192),
        config,
    };

    startup
        .send(&StartupMessage {
            user: config.user.clone(),
            database: Some(config.database.clone()),
            options: config
                .application_name
                .as_ref()
                .map(|name| vec![("application_name".to_string(), name.clone())])
                .unwrap_or_default(),
        })
        .await?;

    let mut parameters = HashMap::new();
    let mut process_id = 0;
    let mut secret_key = 0;

    loop {
        match startup.receive().await? {
            BackendMessage::AuthenticationOk => {
                log::trace!("authenticated as {}", config.user);
            }
            BackendMessage::AuthenticationCleartextPassword => {
                let password = startup.password()?.to_string();
                startup.send(&PasswordMessage { password }).await?;
            }
            BackendMessage::AuthenticationMD5Password { salt } => {
                let password = md5_password(&config.user, startup.password()?, &salt);
                startup.send(&PasswordMessage { password }).await?;
            }
            BackendMessage::AuthenticationSASL { mechanisms } => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PgError::Auth(format!(
                        "Server requires unsupported SASL mechanisms: {:?}",
                        mechanisms
                    )));
                }
                startup.scram().await?;
            }
            BackendMessage::ParameterStatus { name, value } => {
                parameters.insert(name, value);
            }
            BackendMessage::BackendKeyData {
                process_id: pid,
                secret_key: key,
            } => {
                process_id = pid;
                secret_key = key;
            }
            BackendMessage::ReadyForQuery { .. } => {
                log::debug!(
                    "connected to {} (backend pid {})",
                    config.addr(),
                    process_id
                );
                return Ok(Session {
                    stream: startup.stream,
                    read_buf: startup.read_buf,
                    parameters,
                    process_id,
                    secret_key,
                });
            }
            BackendMessage::ErrorResponse { fields } => {
                return Err(error_from_fields(&fields));
            }
            BackendMessage::NoticeResponse { fields } => {
                log::info!(
                    "startup notice: {}",
                    fields.get(&b'M').map(String::as_str).unwrap_or_default()
                );
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "Unexpected message during startup: {:?}",
                    other
                )));
            }
        }
    }
}

struct Startup<'a> {
    stream: TcpStream,
    read_buf: BytesMut,
    config: &'a PgConfig,
}

impl Startup<'_> {
    fn password(&self) -> PgResult<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| PgError::Auth("Password required".to_string()))
    }

    async fn scram(&mut self) -> PgResult<()> {
        let mut scram = ScramClient::new(&self.config.user, self.password()?);
        self.send(&SaslInitialResponseMessage {
            mechanism: SCRAM_SHA_256.to_string(),
            data: scram.client_first_message(),
        })
        .await?;

        loop {
            match self.receive().await? {
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client_final = scram
                        .process_server_first(&data)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    self.send(&SaslResponseMessage { data: client_final })
                        .await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    return scram
                        .verify_server_final(&data)
                        .map_err(|e| PgError::Auth(e.to_string()));
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(error_from_fields(&fields));
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "Unexpected message during SASL exchange: {:?}",
                        other
                    )));
                }
            }
        }
    }

    async fn send<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        self.stream.write_all(&msg.encode()).await?;
        Ok(())
    }

    async fn receive(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(msg) = decode_frame(&mut self.read_buf)? {
                return Ok(msg);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(PgError::ConnectionLost(
                    "server closed the connection during startup".to_string(),
                ));
            }
        }
    }
}
