use anyhow::{bail, Context, Result};
use mptcp_core::mapping::MappedData;
use mptcp_core::KeySource;
use mptcp_transport::{
    AcceptOutcome, ConnectionHandle, JoinOutcome, MptcpConfig, MptcpManager, SubflowId, SynDecision,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// One endpoint of a loopback pair
pub struct Peer {
    pub manager: MptcpManager,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(host: u8) -> Result<Self> {
        Self::with_config(host, MptcpConfig::default())
    }

    pub fn with_config(host: u8, config: MptcpConfig) -> Result<Self> {
        Ok(Self::with_manager(host, MptcpManager::new(config)?))
    }

    pub fn with_manager(host: u8, manager: MptcpManager) -> Self {
        Self {
            manager,
            addr: Self::address(host, 443),
        }
    }

    /// Documentation-range address for `host`
    pub fn address(host: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, host], port))
    }

    /// Run the MP_CAPABLE exchange against `server`. Returns the client
    /// and server connections, each with subflow 0 established.
    pub fn connect(&self, server: &Peer) -> Result<(ConnectionHandle, ConnectionHandle)> {
        let (client_conn, syn) = self.manager.connect(self.addr, server.addr)?;

        let request = match server.manager.on_syn(&syn, server.addr, self.addr)? {
            SynDecision::Capable(request) => request,
            other => bail!("server answered SYN with {:?}", other),
        };
        let syn_ack = request.syn_ack_options()?;
        let ack = client_conn.lock().on_syn_ack(&syn_ack)?;
        if ack.is_empty() {
            bail!("client fell back to plain TCP");
        }

        match server.manager.accept(request, &ack)? {
            AcceptOutcome::Established(server_conn) => {
                tracing::debug!(client = client_conn.token(), server = server_conn.token(), "loopback pair connected");
                Ok((client_conn, server_conn))
            }
            other => bail!("server did not establish: {:?}", other),
        }
    }

    /// Run a full MP_JOIN from `conn` towards `remote` on `server`.
    /// Returns the client-side and server-side subflow ids.
    pub fn join(
        &self,
        server: &Peer,
        conn: &ConnectionHandle,
        local: SocketAddr,
        remote: SocketAddr,
        backup: bool,
    ) -> Result<(SubflowId, SubflowId)> {
        let (id, syn) = conn.lock().open_join(Some(local), remote, 0, backup)?;

        let request = match server.manager.on_syn(&syn, remote, local)? {
            SynDecision::Join(request) => request,
            other => bail!("join refused: {:?}", other),
        };
        let syn_ack = request.syn_ack_options()?;

        let outcome = conn.lock().on_join_syn_ack(id, &syn_ack)?;
        let ack = match outcome {
            JoinOutcome::Established { options } => options,
            JoinOutcome::Rejected => bail!("SYN-ACK failed authentication"),
        };

        let (server_id, fourth) = match server.manager.accept(request, &ack)? {
            AcceptOutcome::Joined { subflow, options, .. } => (subflow, options),
            other => bail!("server did not attach join: {:?}", other),
        };
        conn.lock().on_options(id, &fourth)?;
        tracing::debug!(token = conn.token(), subflow = id, %local, %remote, "loopback join attached");
        Ok((id, server_id))
    }
}

/// Send `payload` on `from_id` and feed the segment to `to_id`
pub fn send(
    from: &ConnectionHandle,
    from_id: SubflowId,
    to: &ConnectionHandle,
    to_id: SubflowId,
    payload: &[u8],
) -> Result<MappedData> {
    let (ssn, options) = {
        let mut conn = from.lock();
        let ssn = conn
            .subflow(from_id)
            .map(|s| s.snd_ssn())
            .context("sending subflow not found")?;
        (ssn, conn.build_data_options(from_id, payload, false)?)
    };

    let mut conn = to.lock();
    conn.on_options(to_id, &options)?;
    Ok(conn.on_data(to_id, ssn, payload)?)
}

/// Exchange one segment each way on the initial subflows so both ends are
/// fully established
pub fn warm_up(client: &ConnectionHandle, server: &ConnectionHandle) -> Result<()> {
    send(client, 0, server, 0, b"ping")?;
    send(server, 0, client, 0, b"pong")?;
    Ok(())
}

/// Always hands out the same key
pub struct FixedKey(pub u64);

impl KeySource for FixedKey {
    fn next_key(&self) -> u64 {
        self.0
    }
}

/// Hands out keys in order, repeating the last one
pub struct ScriptedKeys {
    keys: Mutex<VecDeque<u64>>,
}

impl ScriptedKeys {
    pub fn new(keys: impl IntoIterator<Item = u64>) -> Self {
        Self {
            keys: Mutex::new(keys.into_iter().collect()),
        }
    }
}

impl KeySource for ScriptedKeys {
    fn next_key(&self) -> u64 {
        let mut keys = self.keys.lock();
        if keys.len() > 1 {
            keys.pop_front().unwrap_or_default()
        } else {
            keys.front().copied().unwrap_or_default()
        }
    }
}
