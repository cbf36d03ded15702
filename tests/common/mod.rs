//! Shared test fixtures: a deterministic in-memory datagram network.
//!
//! `SimNet` models the transport boundary the endpoint is written against:
//! fixed-MTU unreliable datagrams, receiver-not-ready back-pressure when the
//! target has no posted buffer, batched submission behind a more-to-come
//! flag, and optional one-sided read.

use std::sync::{Arc, Mutex};

use rdmsg::{
    Addr, AddressVector, BindFlags, CompErr, CompOp, CompQueue, Completion, CqEntry, Endpoint,
    EndpointConfig, EpAddr, IoSeg, NoopRegistrar, ReadDesc, RecvDesc, SendDesc, SrcId, Transport,
};

struct PostedRecv {
    token: u64,
    iov: Vec<IoSeg>,
}

struct Msg {
    dest: usize,
    src: usize,
    token: u64,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Node {
    posted_recvs: std::collections::VecDeque<PostedRecv>,
    comps: std::collections::VecDeque<Completion>,
    errs: std::collections::VecDeque<CompErr>,
    pending: Vec<Msg>,
    /// Fail the next N post_send calls with transient back-pressure.
    again_budget: usize,
    /// Count of messages that actually hit the wire, by first header byte
    /// pair (magic, type).
    delivered_types: Vec<u8>,
}

struct SimNetInner {
    nodes: Vec<Node>,
    mtu: usize,
    read_enabled: bool,
}

/// A shared in-memory datagram fabric.
#[derive(Clone)]
pub struct SimNet {
    inner: Arc<Mutex<SimNetInner>>,
}

impl SimNet {
    pub fn new(mtu: usize, read_enabled: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimNetInner {
                nodes: Vec::new(),
                mtu,
                read_enabled,
            })),
        }
    }

    /// Add a node, returning its transport and fabric-level index.
    pub fn add_node(&self) -> (SimTransport, usize) {
        let mut net = self.inner.lock().unwrap();
        let index = net.nodes.len();
        net.nodes.push(Node::default());
        (
            SimTransport {
                net: self.inner.clone(),
                node: index,
            },
            index,
        )
    }

    /// Make the next `n` sends from `node` fail with transient
    /// back-pressure.
    pub fn inject_again(&self, node: usize, n: usize) {
        self.inner.lock().unwrap().nodes[node].again_budget = n;
    }

    /// Number of receive buffers currently posted at `node`.
    pub fn posted_recvs(&self, node: usize) -> usize {
        self.inner.lock().unwrap().nodes[node].posted_recvs.len()
    }

    /// Wire packet types delivered from `node`, in order.
    pub fn delivered_types(&self, node: usize) -> Vec<u8> {
        self.inner.lock().unwrap().nodes[node].delivered_types.clone()
    }
}

pub struct SimTransport {
    net: Arc<Mutex<SimNetInner>>,
    node: usize,
}

fn gather(iov: &[IoSeg]) -> Vec<u8> {
    let mut out = Vec::new();
    for seg in iov {
        let slice = unsafe { std::slice::from_raw_parts(seg.addr as *const u8, seg.len) };
        out.extend_from_slice(slice);
    }
    out
}

fn scatter(iov: &[IoSeg], bytes: &[u8]) -> usize {
    let mut copied = 0;
    for seg in iov {
        if copied >= bytes.len() {
            break;
        }
        let n = seg.len.min(bytes.len() - copied);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr().add(copied), seg.addr as *mut u8, n);
        }
        copied += n;
    }
    copied
}

fn deliver(net: &mut SimNetInner, msg: Msg) {
    net.nodes[msg.src].delivered_types.push(msg.bytes[1]);
    let recv = net.nodes[msg.dest].posted_recvs.pop_front();
    match recv {
        Some(pr) => {
            let n = scatter(&pr.iov, &msg.bytes);
            assert_eq!(n, msg.bytes.len(), "posted buffer smaller than packet");
            net.nodes[msg.dest].comps.push_back(Completion {
                token: pr.token,
                op: CompOp::Recv,
                len: msg.bytes.len(),
                src: Some(SrcId {
                    node: msg.src as u64,
                    qp: 0,
                }),
            });
            net.nodes[msg.src].comps.push_back(Completion {
                token: msg.token,
                op: CompOp::Send,
                len: msg.bytes.len(),
                src: None,
            });
        }
        None => {
            net.nodes[msg.src].errs.push_back(CompErr {
                token: msg.token,
                op: CompOp::Send,
                rnr: true,
                prov_errno: 0,
            });
        }
    }
}

impl Transport for SimTransport {
    fn mtu(&self) -> usize {
        self.net.lock().unwrap().mtu
    }

    fn local_addr(&self) -> EpAddr {
        EpAddr {
            gid: [self.node as u8; 16],
            qpn: self.node as u16,
        }
    }

    fn post_send(&mut self, desc: &SendDesc<'_>) -> rdmsg::Result<()> {
        let mut net = self.net.lock().unwrap();
        if net.nodes[self.node].again_budget > 0 {
            net.nodes[self.node].again_budget -= 1;
            return Err(rdmsg::Error::Again);
        }
        let bytes = gather(desc.iov);
        assert!(bytes.len() <= net.mtu, "packet exceeds MTU");
        let msg = Msg {
            dest: desc.dest as usize,
            src: self.node,
            token: desc.token,
            bytes,
        };
        net.nodes[self.node].pending.push(msg);
        if !desc.more {
            let pending = std::mem::take(&mut net.nodes[self.node].pending);
            for msg in pending {
                deliver(&mut net, msg);
            }
        }
        Ok(())
    }

    fn post_recv(&mut self, desc: &RecvDesc<'_>) -> rdmsg::Result<()> {
        let mut net = self.net.lock().unwrap();
        net.nodes[self.node].posted_recvs.push_back(PostedRecv {
            token: desc.token,
            iov: desc.iov.to_vec(),
        });
        Ok(())
    }

    fn post_read(&mut self, desc: &ReadDesc<'_>) -> rdmsg::Result<()> {
        let mut net = self.net.lock().unwrap();
        if !net.read_enabled {
            return Err(rdmsg::Error::OpNotSupported);
        }
        let mut bytes = Vec::new();
        for seg in desc.remote {
            let slice =
                unsafe { std::slice::from_raw_parts(seg.addr as *const u8, seg.len as usize) };
            bytes.extend_from_slice(slice);
        }
        let n = scatter(desc.iov, &bytes);
        net.nodes[self.node].comps.push_back(Completion {
            token: desc.token,
            op: CompOp::Read,
            len: n,
            src: None,
        });
        Ok(())
    }

    fn supports_read(&self) -> bool {
        self.net.lock().unwrap().read_enabled
    }

    fn poll_cq(&mut self, max: usize, out: &mut Vec<Completion>) -> usize {
        let mut net = self.net.lock().unwrap();
        let comps = &mut net.nodes[self.node].comps;
        let n = max.min(comps.len());
        out.extend(comps.drain(..n));
        n
    }

    fn poll_err(&mut self) -> Option<CompErr> {
        self.net.lock().unwrap().nodes[self.node].errs.pop_front()
    }

    fn flush(&mut self) {
        let mut net = self.net.lock().unwrap();
        let pending = std::mem::take(&mut net.nodes[self.node].pending);
        for msg in pending {
            deliver(&mut net, msg);
        }
    }
}

/// One endpoint wired to the fabric, with its CQ and bookkeeping.
pub struct TestEp {
    pub ep: Endpoint,
    pub cq: Arc<CompQueue>,
    pub node: usize,
}

impl TestEp {
    pub fn new(net: &SimNet, cfg: EndpointConfig) -> Self {
        let (transport, node) = net.add_node();
        let ep = Endpoint::new(cfg, Box::new(transport), None, Arc::new(NoopRegistrar))
            .expect("endpoint construction");
        ep.bind_av(AddressVector::new()).unwrap();
        let cq = Arc::new(CompQueue::new(1024));
        ep.bind_cq(cq.clone(), BindFlags::TRANSMIT | BindFlags::RECV)
            .unwrap();
        ep.enable().unwrap();
        Self { ep, cq, node }
    }

    /// Insert `other` as a peer and return its address handle.
    pub fn add_peer(&self, other: &TestEp) -> Addr {
        self.ep
            .insert_addr(
                EpAddr {
                    gid: [other.node as u8; 16],
                    qpn: other.node as u16,
                },
                other.node as u64,
                SrcId {
                    node: other.node as u64,
                    qp: 0,
                },
                None,
            )
            .unwrap()
    }

    /// Drain every available completion.
    pub fn completions(&self) -> Vec<CqEntry> {
        let mut out = Vec::new();
        self.cq.read(usize::MAX, &mut out);
        out
    }
}

/// Run both endpoints' progress engines a fixed number of rounds.
pub fn progress_both(a: &TestEp, b: &TestEp, rounds: usize) {
    for _ in 0..rounds {
        a.ep.progress();
        b.ep.progress();
    }
}

/// A pair of connected endpoints on a fresh fabric.
pub fn setup_pair(cfg: EndpointConfig, mtu: usize, read_enabled: bool) -> (TestEp, TestEp, Addr, Addr, SimNet) {
    let net = SimNet::new(mtu, read_enabled);
    let a = TestEp::new(&net, cfg.clone());
    let b = TestEp::new(&net, cfg);
    let b_addr = a.add_peer(&b);
    let a_addr = b.add_peer(&a);
    (a, b, b_addr, a_addr, net)
}

/// Deterministic payload pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}
