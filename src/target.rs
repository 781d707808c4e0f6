//! iSCSI target server implementation
//!
//! One TCP listener accepts connections and spawns a thread per connection;
//! each thread owns a single [`IscsiSession`] and drives it against a shared
//! [`Backend`]. A single backend backs the whole target (one LUN).

use crate::backend::Backend;
use crate::config::TargetConfig;
use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{self, opcode, BHS_SIZE, IscsiPdu};
use crate::session::{DigestType, IscsiSession};
use crate::stats::SessionStats;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// iSCSI target server
pub struct IscsiTarget<B: Backend + 'static> {
    config: TargetConfig,
    backend: Arc<B>,
    stats: Arc<SessionStats>,
    stop: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
    active_sessions: Arc<AtomicUsize>,
    idle_callback: Option<Box<dyn Fn() + Send + Sync>>,
}

impl<B: Backend + 'static> IscsiTarget<B> {
    /// Create a new builder for configuring the target
    pub fn builder() -> IscsiTargetBuilder<B> {
        IscsiTargetBuilder::new()
    }

    /// A handle that can be used to request the accept loop stop; `run()`
    /// polls it roughly every 100ms.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Request the accept loop in `run()` exit. Safe to call from another
    /// thread, typically via a shared `Arc<IscsiTarget<_>>`.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Stop accepting new logins but keep serving already-established
    /// connections. New Login Requests are rejected with
    /// SERVICE_UNAVAILABLE (0x0301) until [`IscsiTarget::stop`] tears down
    /// the listener entirely.
    pub fn shutdown_gracefully(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    /// Protocol counters for this target, shared across every connection.
    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    /// Number of TCP connections currently open against this target.
    pub fn active_connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Number of sessions currently in Full Feature Phase.
    pub fn active_session_count(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Run the iSCSI target server
    ///
    /// Blocks the current thread, accepting connections until `stop()` is
    /// called. Each connection is handled on its own thread. Takes `&self`
    /// so callers can share one target across a listener thread and a
    /// controlling thread via `Arc`.
    pub fn run(&self) -> ScsiResult<()> {
        log::info!("iSCSI target starting on {}", self.config.bind_addr);
        log::info!("Target name: {}", self.config.target_name);

        if !self.backend.begin() {
            return Err(IscsiError::Backend("backend failed to open".to_string()));
        }

        let listener = TcpListener::bind(self.config.bind_addr).map_err(IscsiError::Io)?;
        listener.set_nonblocking(true).map_err(IscsiError::Io)?;

        while !self.stop.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("Connection accepted from {}", peer);
                    let backend = Arc::clone(&self.backend);
                    let stats = Arc::clone(&self.stats);
                    let draining = Arc::clone(&self.draining);
                    let active_connections = Arc::clone(&self.active_connections);
                    let active_sessions = Arc::clone(&self.active_sessions);
                    let target_name = self.config.target_name.clone();
                    let limits = ConnectionLimits {
                        max_connections: self.config.max_connections,
                        max_sessions: self.config.max_sessions,
                        allowed_initiators: self.config.allowed_initiators.clone(),
                    };
                    thread::spawn(move || {
                        active_connections.fetch_add(1, Ordering::Relaxed);
                        let result = handle_connection(
                            stream,
                            backend.as_ref(),
                            &stats,
                            &draining,
                            &active_connections,
                            &active_sessions,
                            &limits,
                            &target_name,
                        );
                        active_connections.fetch_sub(1, Ordering::Relaxed);
                        if let Err(e) = result {
                            log::warn!("Connection {} ended: {}", peer, e);
                        }
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if self.backend.is_idle() {
                        if let Some(cb) = &self.idle_callback {
                            cb();
                        }
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }

        log::info!("iSCSI target stopped");
        Ok(())
    }
}

/// Read one complete PDU (BHS, then AHS + padded data segment) off `stream`,
/// verifying and consuming the 4-byte HeaderDigest/DataDigest trailers if
/// `header_digest`/`data_digest` are negotiated (RFC 3720 Section 3.2.2.1).
fn read_pdu(
    stream: &mut TcpStream,
    header_digest: DigestType,
    data_digest: DigestType,
) -> ScsiResult<IscsiPdu> {
    let mut buf = vec![0u8; BHS_SIZE];
    stream.read_exact(&mut buf).map_err(IscsiError::Io)?;

    if header_digest == DigestType::CRC32C {
        let mut trailer = [0u8; 4];
        stream.read_exact(&mut trailer).map_err(IscsiError::Io)?;
        let received = u32::from_be_bytes(trailer);
        let computed = pdu::header_digest(&buf);
        if received != computed {
            return Err(IscsiError::Digest(format!(
                "header digest mismatch: received 0x{:08x}, computed 0x{:08x}",
                received, computed
            )));
        }
    }

    let data_len = ((buf[5] as u32) << 16) | ((buf[6] as u32) << 8) | (buf[7] as u32);
    let ahs_len = (buf[4] as usize) * 4;
    let padded_data_len = data_len.div_ceil(4) * 4;

    if ahs_len + padded_data_len as usize > 0 {
        let mut rest = vec![0u8; ahs_len + padded_data_len as usize];
        stream.read_exact(&mut rest).map_err(IscsiError::Io)?;
        buf.extend_from_slice(&rest);
    }

    if data_digest == DigestType::CRC32C && data_len > 0 {
        let mut trailer = [0u8; 4];
        stream.read_exact(&mut trailer).map_err(IscsiError::Io)?;
        let received = u32::from_be_bytes(trailer);
        let data_start = BHS_SIZE + ahs_len;
        let computed = pdu::data_digest(&buf[data_start..data_start + data_len as usize]);
        if received != computed {
            return Err(IscsiError::Digest(format!(
                "data digest mismatch: received 0x{:08x}, computed 0x{:08x}",
                received, computed
            )));
        }
    }

    IscsiPdu::from_bytes(&buf)
}

/// Write one complete PDU, appending HeaderDigest/DataDigest trailers if
/// negotiated.
fn write_pdu(
    stream: &mut TcpStream,
    pdu: &IscsiPdu,
    header_digest: DigestType,
    data_digest: DigestType,
) -> ScsiResult<()> {
    let bytes = pdu.to_bytes();
    stream.write_all(&bytes[..BHS_SIZE]).map_err(IscsiError::Io)?;

    if header_digest == DigestType::CRC32C {
        let digest = pdu::header_digest(&bytes[..BHS_SIZE]);
        stream.write_all(&digest.to_be_bytes()).map_err(IscsiError::Io)?;
    }

    if bytes.len() > BHS_SIZE {
        stream.write_all(&bytes[BHS_SIZE..]).map_err(IscsiError::Io)?;
    }

    if data_digest == DigestType::CRC32C && !pdu.data.is_empty() {
        let digest = pdu::data_digest(&pdu.data);
        stream.write_all(&digest.to_be_bytes()).map_err(IscsiError::Io)?;
    }

    Ok(())
}

/// Admin-configured limits consulted during login, beyond the plain
/// protocol negotiation.
struct ConnectionLimits {
    max_connections: Option<usize>,
    max_sessions: Option<usize>,
    allowed_initiators: Option<Vec<String>>,
}

/// Drive one TCP connection to completion: a login phase followed by SCSI
/// command/data-out traffic in full feature phase, until logout or
/// disconnect.
fn handle_connection<B: Backend>(
    stream: TcpStream,
    backend: &B,
    stats: &SessionStats,
    draining: &AtomicBool,
    active_connections: &AtomicUsize,
    active_sessions: &AtomicUsize,
    limits: &ConnectionLimits,
    target_name: &str,
) -> ScsiResult<()> {
    stream.set_nodelay(true).ok();
    let mut reader = stream.try_clone().map_err(IscsiError::Io)?;
    let mut writer = stream;

    let mut session = IscsiSession::new();
    let mut logged_in = false;
    let mut counted_session = false;

    let result = (|| -> ScsiResult<()> {
    loop {
        let pdu = match read_pdu(&mut reader, session.params.header_digest, session.params.data_digest) {
            Ok(pdu) => pdu,
            Err(IscsiError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::info!("Initiator closed the connection");
                return Ok(());
            }
            Err(IscsiError::Digest(msg)) => {
                log::warn!("Digest mismatch from {:?}: {}", writer.peer_addr(), msg);
                stats.inc_digest_errors();
                let resp = session.create_reject(pdu::reject_reason::DATA_DIGEST_ERROR);
                write_pdu(&mut writer, &resp, session.params.header_digest, session.params.data_digest)?;
                return Ok(());
            }
            Err(e) => {
                stats.inc_format_errors();
                return Err(e);
            }
        };
        stats.inc_cmd_pdus();

        if !logged_in && pdu.opcode != opcode::LOGIN_REQUEST {
            let resp = session.create_invalid_request_during_login_reject(pdu.itt)?;
            write_pdu(&mut writer, &resp, session.params.header_digest, session.params.data_digest)?;
            return Ok(());
        }

        match pdu.opcode {
            opcode::LOGIN_REQUEST => {
                if !logged_in && draining.load(Ordering::Relaxed) {
                    let resp = session.create_shutdown_reject(pdu.itt)?;
                    write_pdu(&mut writer, &resp, session.params.header_digest, session.params.data_digest)?;
                    return Ok(());
                }

                if !logged_in {
                    if let Some(max) = limits.max_connections {
                        if active_connections.load(Ordering::Relaxed) > max {
                            let resp = session.create_too_many_connections_reject(pdu.itt)?;
                            write_pdu(&mut writer, &resp, session.params.header_digest, session.params.data_digest)?;
                            return Ok(());
                        }
                    }

                    if let Some(allowed) = &limits.allowed_initiators {
                        let login = pdu.parse_login_request()?;
                        let initiator = login
                            .parameters
                            .iter()
                            .find(|(k, _)| k == "InitiatorName")
                            .map(|(_, v)| v.as_str());
                        if let Some(name) = initiator {
                            if !allowed.iter().any(|a| a == name) {
                                let resp = session.create_authorization_failure_reject(pdu.itt)?;
                                write_pdu(&mut writer, &resp, session.params.header_digest, session.params.data_digest)?;
                                return Ok(());
                            }
                        }
                    }
                }

                let about_to_go_full_feature = {
                    let login = pdu.parse_login_request()?;
                    login.transit && login.nsg == 3
                };

                if about_to_go_full_feature && !session.is_full_feature() {
                    if let Some(max) = limits.max_sessions {
                        if active_sessions.load(Ordering::Relaxed) >= max {
                            let resp = session.create_out_of_resources_reject(pdu.itt)?;
                            write_pdu(&mut writer, &resp, session.params.header_digest, session.params.data_digest)?;
                            return Ok(());
                        }
                    }
                }

                let resp = session.process_login(&pdu, target_name)?;
                stats.inc_login_accepts();
                logged_in = true;

                if session.is_full_feature() && !counted_session {
                    active_sessions.fetch_add(1, Ordering::Relaxed);
                    counted_session = true;
                }

                write_pdu(&mut writer, &resp, session.params.header_digest, session.params.data_digest)?;
            }
            opcode::SCSI_COMMAND => {
                let responses = session.process_scsi_command(&pdu, backend)?;
                let should_close = responses.iter().any(|r| r.opcode == opcode::REJECT);
                for resp in &responses {
                    write_pdu(&mut writer, resp, session.params.header_digest, session.params.data_digest)?;
                }
                if should_close {
                    return Ok(());
                }
            }
            opcode::SCSI_DATA_OUT => {
                let responses = session.process_data_out(&pdu, backend)?;
                let should_close = responses.iter().any(|r| r.opcode == opcode::REJECT);
                for resp in &responses {
                    write_pdu(&mut writer, resp, session.params.header_digest, session.params.data_digest)?;
                }
                if should_close {
                    return Ok(());
                }
            }
            opcode::NOP_OUT => match session.process_nop_out(&pdu) {
                Ok(resp) => write_pdu(&mut writer, &resp, session.params.header_digest, session.params.data_digest)?,
                Err(_) => continue, // unsolicited ping response, no reply due
            },
            opcode::TEXT_REQUEST => {
                let resp = handle_text_request(&mut session, &pdu, target_name)?;
                write_pdu(&mut writer, &resp, session.params.header_digest, session.params.data_digest)?;
            }
            opcode::LOGOUT_REQUEST => {
                let resp = session.process_logout(&pdu)?;
                stats.inc_logout_normals();
                write_pdu(&mut writer, &resp, session.params.header_digest, session.params.data_digest)?;
                return Ok(());
            }
            other => {
                log::warn!("Unsupported opcode 0x{:02x} from {:?}", other, writer.peer_addr());
                stats.inc_session_failures();
            }
        }
    }
    })();

    if counted_session {
        active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
    result
}

/// Handle a Text Request PDU; the only key this target negotiates over text
/// mode is `SendTargets`, used for discovery sessions.
fn handle_text_request(
    session: &mut IscsiSession,
    pdu: &IscsiPdu,
    target_name: &str,
) -> ScsiResult<IscsiPdu> {
    let text = pdu.parse_text_request()?;

    let wants_send_targets = text.parameters.iter().any(|(k, _)| k == "SendTargets");
    let response_params = if wants_send_targets {
        session.handle_send_targets(target_name, "0.0.0.0:3260")
    } else {
        vec![]
    };

    Ok(IscsiPdu::text_response(
        text.itt,
        0xFFFF_FFFF,
        session.next_stat_sn(),
        session.exp_cmd_sn,
        session.max_cmd_sn,
        true,
        pdu::serialize_text_parameters(&response_params),
    ))
}

/// Builder for configuring an iSCSI target
pub struct IscsiTargetBuilder<B: Backend> {
    config: TargetConfig,
    idle_callback: Option<Box<dyn Fn() + Send + Sync>>,
    _phantom: std::marker::PhantomData<B>,
}

impl<B: Backend> IscsiTargetBuilder<B> {
    fn new() -> Self {
        Self {
            config: TargetConfig::default(),
            idle_callback: None,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Set the bind address (default: 0.0.0.0:3260)
    pub fn bind_addr(mut self, addr: &str) -> Self {
        if let Ok(parsed) = addr.parse() {
            self.config.bind_addr = parsed;
        }
        self
    }

    /// Set the iSCSI target name (IQN format)
    ///
    /// Example: iqn.2026-01.local:storage.disk1
    pub fn target_name(mut self, name: &str) -> Self {
        self.config.target_name = name.to_string();
        self
    }

    /// Supply a full [`TargetConfig`] (negotiation defaults, retry policy,
    /// range lock count) instead of setting fields individually.
    pub fn config(mut self, config: TargetConfig) -> Self {
        self.config = config;
        self
    }

    /// Cap the number of concurrent TCP connections; further logins are
    /// rejected with TOO_MANY_CONNECTIONS (0x0206).
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = Some(max);
        self
    }

    /// Cap the number of sessions in Full Feature Phase; further logins are
    /// rejected with OUT_OF_RESOURCES (0x0302).
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = Some(max);
        self
    }

    /// Restrict logins to the given initiator IQNs; anything else is
    /// rejected with AUTHORIZATION_FAILURE (0x0202).
    pub fn allowed_initiators(mut self, initiators: Vec<String>) -> Self {
        self.config.allowed_initiators = Some(initiators);
        self
    }

    /// Called from the accept loop whenever the backend has been idle (no
    /// read/write/trim/compare-write) for at least half a second. A
    /// constrained build with its own cooperative scheduler hooks this to
    /// service SNMP/watchdog work between socket waits; most callers leave
    /// it unset.
    pub fn idle_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.idle_callback = Some(Box::new(callback));
        self
    }

    /// Build the target against the given backend.
    pub fn build(self, backend: B) -> ScsiResult<IscsiTarget<B>> {
        self.config.validate()?;

        Ok(IscsiTarget {
            config: self.config,
            backend: Arc::new(backend),
            stats: Arc::new(SessionStats::new()),
            stop: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            idle_callback: self.idle_callback,
        })
    }
}
