//! In-process xenstore daemon.
//!
//! Consumes request bytes from a [`StoreRing`], keeps a tree of nodes with
//! permissions, runs transactions with optimistic concurrency (a commit
//! fails with `EAGAIN` if anything was written since the transaction
//! started) and produces response bytes at whatever pace the guest drains
//! the response ring.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::Ordering;

use khal::store::{mask_xenstore_idx, StoreRing, XsdSockMsg, XsdType, XENSTORE_RING_SIZE, XBT_NIL};

#[derive(Debug, Clone, Default)]
struct Node {
    value: Vec<u8>,
    perms: Vec<String>,
}

type Tree = BTreeMap<String, Node>;

struct Transaction {
    tree: Tree,
    generation: u64,
}

/// One request as the daemon saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    pub kind: Option<XsdType>,
    pub req_id: u32,
    pub tx_id: u32,
    /// First NUL-terminated field of the payload (usually the path).
    pub path: String,
    /// Remaining payload bytes.
    pub value: Vec<u8>,
}

pub struct StoreDaemon {
    domid: u16,
    tree: Tree,
    generation: u64,
    transactions: BTreeMap<u32, Transaction>,
    next_tx: u32,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    log: Vec<StoreRequest>,
    forced_conflicts: u32,
    corrupt_next_reply: bool,
    stalled: bool,
}

impl StoreDaemon {
    pub fn new(domid: u16) -> Self {
        let mut daemon = Self {
            domid,
            tree: Tree::new(),
            generation: 0,
            transactions: BTreeMap::new(),
            next_tx: 1,
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            log: Vec::new(),
            forced_conflicts: 0,
            corrupt_next_reply: false,
            stalled: false,
        };
        let home = daemon.home();
        let owner = format!("n{}", domid);
        daemon.insert_node(&format!("{}/domid", home), domid.to_string().into_bytes(), &owner);
        daemon.insert_node(&format!("{}/data", home), Vec::new(), "n0");
        daemon.insert_node(&format!("{}/control", home), Vec::new(), &owner);
        daemon
    }

    fn home(&self) -> String {
        format!("/local/domain/{}", self.domid)
    }

    fn absolute(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.trim_end_matches('/').to_string()
        } else {
            format!("{}/{}", self.home(), path.trim_end_matches('/'))
        }
    }

    fn insert_node(&mut self, path: &str, value: Vec<u8>, owner: &str) {
        create_parents(&mut self.tree, path, owner);
        self.tree.insert(
            path.to_string(),
            Node {
                value,
                perms: vec![owner.to_string()],
            },
        );
    }

    // --- Test-facing accessors ---

    /// Value stored at `path` (relative paths resolve under the guest's home).
    pub fn value(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.get(&self.absolute(path)).map(|n| n.value.clone())
    }

    pub fn perms(&self, path: &str) -> Option<Vec<String>> {
        self.tree.get(&self.absolute(path)).map(|n| n.perms.clone())
    }

    /// Write from outside the guest (another domain or the toolstack).
    pub fn external_write(&mut self, path: &str, value: &[u8]) {
        let abs = self.absolute(path);
        let owner = "n0".to_string();
        self.insert_node(&abs, value.to_vec(), &owner);
        self.generation += 1;
    }

    pub fn requests(&self) -> &[StoreRequest] {
        &self.log
    }

    pub fn open_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Fail the next `count` commits with `EAGAIN`.
    pub fn force_conflicts(&mut self, count: u32) {
        self.forced_conflicts = count;
    }

    /// Answer the next request with a wrong request id.
    pub fn corrupt_next_reply(&mut self) {
        self.corrupt_next_reply = true;
    }

    /// Stop touching the ring, as if the daemon had hung.
    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    // --- Ring processing ---

    /// Move bytes between the ring and the daemon. Returns `true` when new
    /// response bytes were published.
    pub fn pump(&mut self, ring: &StoreRing) -> bool {
        if self.stalled {
            return false;
        }
        let mut cons = ring.req_cons.load(Ordering::Acquire);
        let prod = ring.req_prod.load(Ordering::Acquire);
        while cons != prod {
            self.inbox.push(ring.req[mask_xenstore_idx(cons)].load(Ordering::Relaxed));
            cons = cons.wrapping_add(1);
        }
        ring.req_cons.store(cons, Ordering::Release);

        while self.inbox.len() >= XsdSockMsg::SIZE {
            let mut raw = [0u8; XsdSockMsg::SIZE];
            raw.copy_from_slice(&self.inbox[..XsdSockMsg::SIZE]);
            let header = XsdSockMsg::from_bytes(&raw);
            let total = XsdSockMsg::SIZE + header.len as usize;
            if self.inbox.len() < total {
                break;
            }
            let payload: Vec<u8> = self.inbox[XsdSockMsg::SIZE..total].to_vec();
            self.inbox.drain(..total);
            self.handle(header, &payload);
        }

        let mut published = false;
        let mut rsp_prod = ring.rsp_prod.load(Ordering::Relaxed);
        while let Some(&byte) = self.outbox.front() {
            let used = rsp_prod.wrapping_sub(ring.rsp_cons.load(Ordering::Acquire)) as usize;
            if used >= XENSTORE_RING_SIZE {
                break;
            }
            ring.rsp[mask_xenstore_idx(rsp_prod)].store(byte, Ordering::Relaxed);
            rsp_prod = rsp_prod.wrapping_add(1);
            self.outbox.pop_front();
            published = true;
        }
        ring.rsp_prod.store(rsp_prod, Ordering::Release);
        published
    }

    fn handle(&mut self, header: XsdSockMsg, payload: &[u8]) {
        let kind = header.message_type();
        let (path, rest) = split_field(payload);
        self.log.push(StoreRequest {
            kind,
            req_id: header.req_id,
            tx_id: header.tx_id,
            path: path.clone(),
            value: rest.to_vec(),
        });

        let result = match kind {
            Some(kind) => self.execute(kind, header.tx_id, &path, rest),
            None => Err("EINVAL"),
        };

        let mut req_id = header.req_id;
        if self.corrupt_next_reply {
            self.corrupt_next_reply = false;
            req_id = req_id.wrapping_add(100);
        }

        let (reply_kind, body) = match result {
            Ok(body) => (header.kind, body),
            Err(errno) => {
                let mut body = errno.as_bytes().to_vec();
                body.push(0);
                (XsdType::Error as u32, body)
            }
        };
        let reply = XsdSockMsg {
            kind: reply_kind,
            req_id,
            tx_id: header.tx_id,
            len: body.len() as u32,
        };
        self.outbox.extend(reply.to_bytes());
        self.outbox.extend(body);
    }

    fn execute(&mut self, kind: XsdType, tx: u32, path: &str, rest: &[u8]) -> Result<Vec<u8>, &'static str> {
        match kind {
            XsdType::TransactionStart => {
                let id = self.next_tx;
                self.next_tx += 1;
                self.transactions.insert(
                    id,
                    Transaction {
                        tree: self.tree.clone(),
                        generation: self.generation,
                    },
                );
                Ok(nul_terminated(id.to_string().as_bytes()))
            }
            XsdType::TransactionEnd => {
                let txn = self.transactions.remove(&tx).ok_or("ENOENT")?;
                match path {
                    "T" => {
                        if self.forced_conflicts > 0 {
                            self.forced_conflicts -= 1;
                            return Err("EAGAIN");
                        }
                        if txn.generation != self.generation {
                            return Err("EAGAIN");
                        }
                        self.tree = txn.tree;
                        self.generation += 1;
                        Ok(ok())
                    }
                    "F" => Ok(ok()),
                    _ => Err("EINVAL"),
                }
            }
            XsdType::GetDomainPath => Ok(nul_terminated(format!("/local/domain/{}", path).as_bytes())),
            _ => {
                let abs = self.absolute(path);
                let owner = format!("n{}", self.domid);
                let writes = matches!(kind, XsdType::Write | XsdType::Mkdir | XsdType::Rm | XsdType::SetPerms);
                let tree = if tx == XBT_NIL {
                    &mut self.tree
                } else {
                    &mut self.transactions.get_mut(&tx).ok_or("ENOENT")?.tree
                };
                let reply = tree_op(tree, kind, &abs, rest, &owner)?;
                if writes && tx == XBT_NIL {
                    self.generation += 1;
                }
                Ok(reply)
            }
        }
    }
}

fn tree_op(tree: &mut Tree, kind: XsdType, abs: &str, rest: &[u8], owner: &str) -> Result<Vec<u8>, &'static str> {
    match kind {
        XsdType::Read => tree.get(abs).map(|n| n.value.clone()).ok_or("ENOENT"),
        XsdType::Write => {
            create_parents(tree, abs, owner);
            let node = tree.entry(abs.to_string()).or_insert_with(|| Node {
                value: Vec::new(),
                perms: vec![owner.to_string()],
            });
            node.value = rest.to_vec();
            Ok(ok())
        }
        XsdType::Mkdir => {
            create_parents(tree, abs, owner);
            tree.entry(abs.to_string()).or_insert_with(|| Node {
                value: Vec::new(),
                perms: vec![owner.to_string()],
            });
            Ok(ok())
        }
        XsdType::Rm => {
            if !tree.contains_key(abs) {
                return Err("ENOENT");
            }
            let prefix = format!("{}/", abs);
            tree.retain(|k, _| k != abs && !k.starts_with(&prefix));
            Ok(ok())
        }
        XsdType::Directory => {
            if !tree.contains_key(abs) {
                return Err("ENOENT");
            }
            let prefix = format!("{}/", abs);
            let mut out = Vec::new();
            for key in tree.keys() {
                if let Some(child) = key.strip_prefix(&prefix) {
                    if !child.contains('/') {
                        out.extend_from_slice(child.as_bytes());
                        out.push(0);
                    }
                }
            }
            Ok(out)
        }
        XsdType::GetPerms => {
            let node = tree.get(abs).ok_or("ENOENT")?;
            let mut out = Vec::new();
            for perm in &node.perms {
                out.extend_from_slice(perm.as_bytes());
                out.push(0);
            }
            Ok(out)
        }
        XsdType::SetPerms => {
            let node = tree.get_mut(abs).ok_or("ENOENT")?;
            let perms: Vec<String> = rest
                .split(|&b| b == 0)
                .filter(|p| !p.is_empty())
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .collect();
            if perms.is_empty() {
                return Err("EINVAL");
            }
            node.perms = perms;
            Ok(ok())
        }
        _ => Err("ENOSYS"),
    }
}

fn create_parents(tree: &mut Tree, path: &str, owner: &str) {
    if path.len() <= 1 {
        return;
    }
    let mut end = 0;
    while let Some(pos) = path[end + 1..].find('/') {
        end += pos + 1;
        let parent = &path[..end];
        if !parent.is_empty() && !tree.contains_key(parent) {
            tree.insert(
                parent.to_string(),
                Node {
                    value: Vec::new(),
                    perms: vec![owner.to_string()],
                },
            );
        }
    }
}

fn split_field(payload: &[u8]) -> (String, &[u8]) {
    match payload.iter().position(|&b| b == 0) {
        Some(nul) => (String::from_utf8_lossy(&payload[..nul]).into_owned(), &payload[nul + 1..]),
        None => (String::from_utf8_lossy(payload).into_owned(), &[]),
    }
}

fn nul_terminated(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.push(0);
    out
}

fn ok() -> Vec<u8> {
    nul_terminated(b"OK")
}
