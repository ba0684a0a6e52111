//! SSH transport for remote Docker daemons.
//!
//! A tunnel authenticates an ssh2 session against the remote host and
//! forwards a loopback TCP listener to the remote daemon's Unix socket via
//! `direct-streamlocal` channels. bollard then speaks HTTP to the loopback
//! address. Connections are never pooled across operations: each resolve
//! opens a tunnel, each drop tears it down.

use super::secrets::AuthSecret;
use crate::error::{ErrorKind, PilotError, Result};
use ssh2::Session;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{debug, warn};

/// Remote daemon socket forwarded through the tunnel.
const REMOTE_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// TCP connect timeout to the SSH port.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Generate the one-shot TOTP code for a base32 seed.
fn totp_code(seed: &str) -> Result<String> {
    let secret = Secret::Encoded(seed.to_string()).to_bytes().map_err(|_| {
        PilotError::new(ErrorKind::TotpInvalid, "TOTP seed is not valid base32")
    })?;
    let totp = TOTP::new_unchecked(Algorithm::SHA1, 6, 1, 30, secret);
    totp.generate_current()
        .map_err(|e| PilotError::new(ErrorKind::TotpInvalid, format!("TOTP generation: {e}")))
}

/// Keyboard-interactive responder: answers password prompts with the stored
/// password and verification-code prompts with a freshly generated TOTP code.
struct TotpPrompt {
    password: String,
    code: String,
}

impl ssh2::KeyboardInteractivePrompt for TotpPrompt {
    fn prompt(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'_>],
    ) -> Vec<String> {
        prompts
            .iter()
            .map(|p| {
                let text = p.text.to_lowercase();
                if text.contains("password") {
                    self.password.clone()
                } else {
                    // Verification code / OTP prompt.
                    self.code.clone()
                }
            })
            .collect()
    }
}

fn authenticate(session: &Session, username: &str, secret: &AuthSecret) -> Result<()> {
    match secret {
        AuthSecret::Password { password } => {
            session.userauth_password(username, password).map_err(|e| {
                PilotError::new(ErrorKind::AuthRejected, format!("password auth: {e}"))
            })?;
        }
        AuthSecret::Key { private_key } => {
            session
                .userauth_pubkey_memory(username, None, private_key, None)
                .map_err(|e| {
                    PilotError::new(ErrorKind::AuthRejected, format!("key auth: {e}"))
                })?;
        }
        AuthSecret::KeyPassphrase {
            private_key,
            passphrase,
        } => {
            session
                .userauth_pubkey_memory(username, None, private_key, Some(passphrase))
                .map_err(|e| {
                    PilotError::new(ErrorKind::AuthRejected, format!("key auth: {e}"))
                })?;
        }
        AuthSecret::PasswordTotp {
            password,
            totp_seed,
        } => {
            if totp_seed.is_empty() {
                return Err(PilotError::new(
                    ErrorKind::TotpRequired,
                    "host requires a TOTP seed",
                ));
            }
            let mut prompt = TotpPrompt {
                password: password.clone(),
                code: totp_code(totp_seed)?,
            };
            session
                .userauth_keyboard_interactive(username, &mut prompt)
                .map_err(|e| {
                    PilotError::new(ErrorKind::TotpInvalid, format!("TOTP auth: {e}"))
                })?;
        }
    }

    if !session.authenticated() {
        return Err(PilotError::new(
            ErrorKind::AuthRejected,
            "server rejected the credentials",
        ));
    }
    Ok(())
}

/// Write all bytes to a possibly non-blocking writer, retrying WouldBlock.
fn write_all_retry(writer: &mut impl Write, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Pump one accepted connection through a fresh streamlocal channel.
/// libssh2 serializes all channel traffic on the session, so connections are
/// handled one at a time; bollard keeps one pooled connection per host which
/// makes this sufficient in practice.
fn proxy_connection(session: &Session, mut stream: TcpStream) -> std::io::Result<()> {
    let mut channel = session
        .channel_direct_streamlocal(REMOTE_DOCKER_SOCKET, None)
        .map_err(|e| std::io::Error::other(format!("streamlocal channel: {e}")))?;

    stream.set_nonblocking(true)?;
    session.set_blocking(false);

    let mut stream_buf = [0u8; 16 * 1024];
    let mut channel_buf = [0u8; 16 * 1024];
    let mut stream_eof = false;

    loop {
        let mut idle = true;

        if !stream_eof {
            match stream.read(&mut stream_buf) {
                Ok(0) => {
                    stream_eof = true;
                    let _ = channel.send_eof();
                }
                Ok(n) => {
                    idle = false;
                    write_all_retry(&mut channel, &stream_buf[..n])?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        match channel.read(&mut channel_buf) {
            Ok(0) => {
                if channel.eof() {
                    break;
                }
            }
            Ok(n) => {
                idle = false;
                write_all_retry(&mut stream, &channel_buf[..n])?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        if channel.eof() {
            break;
        }
        if idle {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    session.set_blocking(true);
    let _ = channel.close();
    Ok(())
}

/// A live SSH tunnel to one remote daemon.
///
/// Dropping the tunnel stops the forwarder thread and closes the session.
#[derive(Debug)]
pub struct SshTunnel {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
}

impl SshTunnel {
    /// Open and authenticate a tunnel. Blocking; run under `spawn_blocking`.
    pub fn open(
        hostname: &str,
        port: u16,
        username: &str,
        secret: &AuthSecret,
    ) -> Result<SshTunnel> {
        let address = format!("{hostname}:{port}");
        debug!(address, "opening SSH tunnel");

        let socket_addr = address
            .parse()
            .or_else(|_| {
                use std::net::ToSocketAddrs;
                address
                    .to_socket_addrs()
                    .map_err(|e| {
                        PilotError::new(ErrorKind::Unreachable, format!("resolve {address}: {e}"))
                    })?
                    .next()
                    .ok_or_else(|| {
                        PilotError::new(
                            ErrorKind::Unreachable,
                            format!("{address} resolves to no addresses"),
                        )
                    })
            })?;
        let tcp = TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT).map_err(|e| {
            PilotError::new(ErrorKind::Unreachable, format!("connect {address}: {e}"))
        })?;

        let mut session = Session::new().map_err(|e| {
            PilotError::new(ErrorKind::Unreachable, format!("ssh session: {e}"))
        })?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| {
            PilotError::new(ErrorKind::Unreachable, format!("ssh handshake: {e}"))
        })?;

        authenticate(&session, username, secret)?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| PilotError::new(ErrorKind::IoError, format!("bind forwarder: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PilotError::new(ErrorKind::IoError, e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| PilotError::new(ErrorKind::IoError, e.to_string()))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let thread_host = hostname.to_string();

        std::thread::Builder::new()
            .name(format!("ssh-tunnel-{hostname}"))
            .spawn(move || {
                while !thread_shutdown.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if let Err(e) = proxy_connection(&session, stream) {
                                warn!(host = %thread_host, error = %e, "tunnel connection ended");
                            }
                            session.set_blocking(true);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        Err(e) => {
                            warn!(host = %thread_host, error = %e, "tunnel accept failed");
                            break;
                        }
                    }
                }
                debug!(host = %thread_host, "SSH tunnel closed");
            })
            .map_err(|e| PilotError::new(ErrorKind::IoError, format!("spawn forwarder: {e}")))?;

        debug!(%local_addr, "SSH tunnel forwarding");
        Ok(SshTunnel {
            local_addr,
            shutdown,
        })
    }

    /// Loopback address bollard connects to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totp_codes_are_six_digits() {
        let code = totp_code("JBSWY3DPEHPK3PXP").unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn invalid_seed_is_typed() {
        let err = totp_code("not base32 at all!!!").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TotpInvalid);
    }

    #[test]
    fn unreachable_host_is_typed() {
        let secret = AuthSecret::Password {
            password: "x".to_string(),
        };
        // TEST-NET-1 address, guaranteed non-routable.
        let err = SshTunnel::open("192.0.2.1", 22, "root", &secret).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }
}
