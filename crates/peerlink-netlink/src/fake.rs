//! In-memory [`NetConfig`] for tests.
//!
//! The fake mirrors kernel semantics closely enough for the idempotence
//! wrappers to be exercised: duplicate adds fail with `File exists`, deletes
//! of missing objects fail with `No such process`, and operations on unknown
//! devices fail with `Cannot find device`. Every call is counted.
//!
//! With [`FakeNetConfig::interleaved`] every call yields to the scheduler
//! first, so concurrent callers under `tokio::join!` interleave at each
//! kernel call the way they would against real commands.

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink_common::{PeerlinkError, PeerlinkResult};
use peerlink_types::{Neighbor, PolicyRule, RouteEntry, TableId};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::types::{IfAddr, Link, VxlanAttrs, VxlanSpec};
use crate::NetConfig;

#[derive(Debug, Default)]
struct KernelState {
    links: BTreeMap<String, Link>,
    next_index: u32,
    addrs: BTreeMap<String, BTreeSet<IfAddr>>,
    fdb: BTreeMap<String, BTreeSet<Neighbor>>,
    routes: BTreeSet<RouteEntry>,
    rules: Vec<PolicyRule>,
}

#[derive(Debug, Default)]
pub struct FakeNetConfig {
    state: Mutex<KernelState>,
    calls: AtomicUsize,
    failing: Mutex<HashSet<&'static str>>,
    interleave: AtomicBool,
}

fn failed(op: &str, output: &str) -> PeerlinkError {
    PeerlinkError::ShellCommandFailed {
        command: op.to_string(),
        exit_code: 2,
        output: output.to_string(),
    }
}

impl FakeNetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-creates a plain link (builder pattern).
    pub fn with_link(self, name: &str) -> Self {
        {
            let mut state = self.state.lock();
            Self::insert_link(&mut state, name, None, 1500, None);
        }
        self
    }

    fn insert_link(
        state: &mut KernelState,
        name: &str,
        kind: Option<&str>,
        mtu: u32,
        vxlan: Option<VxlanAttrs>,
    ) {
        state.next_index += 1;
        let link = Link {
            name: name.to_string(),
            index: state.next_index,
            kind: kind.map(str::to_string),
            mtu,
            up: false,
            mac: None,
            vxlan,
        };
        state.links.insert(name.to_string(), link);
    }

    /// Yields before every call (builder pattern).
    pub fn interleaved(self) -> Self {
        self.interleave.store(true, Ordering::SeqCst);
        self
    }

    /// Makes every subsequent call of `op` (the trait method name) fail.
    pub fn fail_on(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Total number of calls made through the [`NetConfig`] trait.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn link(&self, name: &str) -> Option<Link> {
        self.state.lock().links.get(name).cloned()
    }

    pub fn addrs(&self, name: &str) -> BTreeSet<IfAddr> {
        self.state.lock().addrs.get(name).cloned().unwrap_or_default()
    }

    pub fn fdb(&self, dev: &str) -> BTreeSet<Neighbor> {
        self.state.lock().fdb.get(dev).cloned().unwrap_or_default()
    }

    pub fn routes(&self, table: TableId) -> Vec<RouteEntry> {
        self.state
            .lock()
            .routes
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect()
    }

    pub fn rules(&self) -> Vec<PolicyRule> {
        self.state.lock().rules.clone()
    }

    async fn enter(&self, op: &'static str) -> PeerlinkResult<()> {
        if self.interleave.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(op) {
            return Err(failed(op, "injected failure"));
        }
        Ok(())
    }
}

fn require_link<'a>(state: &'a mut KernelState, op: &str, name: &str) -> PeerlinkResult<&'a mut Link> {
    state
        .links
        .get_mut(name)
        .ok_or_else(|| failed(op, &format!("Cannot find device \"{}\"", name)))
}

#[async_trait]
impl NetConfig for FakeNetConfig {
    async fn link_by_name(&self, name: &str) -> PeerlinkResult<Option<Link>> {
        self.enter("link_by_name").await?;
        Ok(self.state.lock().links.get(name).cloned())
    }

    async fn add_vxlan_link(&self, spec: &VxlanSpec) -> PeerlinkResult<()> {
        self.enter("add_vxlan_link").await?;
        let mut state = self.state.lock();
        if state.links.contains_key(&spec.name) {
            return Err(failed("add_vxlan_link", "RTNETLINK answers: File exists"));
        }
        let attrs = VxlanAttrs {
            vni: spec.vni,
            local: Some(spec.local),
            port: spec.port,
            parent: spec.parent.clone(),
        };
        Self::insert_link(&mut state, &spec.name, Some("vxlan"), spec.mtu, Some(attrs));
        if let Some(link) = state.links.get_mut(&spec.name) {
            link.mac = spec.mac;
        }
        Ok(())
    }

    async fn add_link(&self, name: &str, kind: &str) -> PeerlinkResult<()> {
        self.enter("add_link").await?;
        let mut state = self.state.lock();
        if state.links.contains_key(name) {
            return Err(failed("add_link", "RTNETLINK answers: File exists"));
        }
        Self::insert_link(&mut state, name, Some(kind), 1420, None);
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> PeerlinkResult<()> {
        self.enter("delete_link").await?;
        let mut state = self.state.lock();
        require_link(&mut state, "delete_link", name)?;
        state.links.remove(name);
        state.addrs.remove(name);
        state.fdb.remove(name);
        state.routes.retain(|r| r.device != name);
        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> PeerlinkResult<()> {
        self.enter("set_link_up").await?;
        let mut state = self.state.lock();
        require_link(&mut state, "set_link_up", name)?.up = true;
        Ok(())
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> PeerlinkResult<()> {
        self.enter("set_mtu").await?;
        let mut state = self.state.lock();
        require_link(&mut state, "set_mtu", name)?.mtu = mtu;
        Ok(())
    }

    async fn list_addrs(&self, name: &str) -> PeerlinkResult<Vec<IfAddr>> {
        self.enter("list_addrs").await?;
        let mut state = self.state.lock();
        require_link(&mut state, "list_addrs", name)?;
        Ok(state
            .addrs
            .get(name)
            .map(|a| a.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn add_addr(&self, name: &str, addr: IfAddr) -> PeerlinkResult<()> {
        self.enter("add_addr").await?;
        let mut state = self.state.lock();
        require_link(&mut state, "add_addr", name)?;
        if !state.addrs.entry(name.to_string()).or_default().insert(addr) {
            return Err(failed("add_addr", "RTNETLINK answers: File exists"));
        }
        Ok(())
    }

    async fn del_addr(&self, name: &str, addr: IfAddr) -> PeerlinkResult<()> {
        self.enter("del_addr").await?;
        let mut state = self.state.lock();
        let removed = state
            .addrs
            .get_mut(name)
            .map_or(false, |set| set.remove(&addr));
        if !removed {
            return Err(failed("del_addr", "RTNETLINK answers: Cannot assign requested address"));
        }
        Ok(())
    }

    async fn list_fdb(&self, dev: &str) -> PeerlinkResult<Vec<Neighbor>> {
        self.enter("list_fdb").await?;
        let mut state = self.state.lock();
        require_link(&mut state, "list_fdb", dev)?;
        Ok(state
            .fdb
            .get(dev)
            .map(|f| f.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn append_fdb(&self, dev: &str, neighbor: &Neighbor) -> PeerlinkResult<()> {
        self.enter("append_fdb").await?;
        let mut state = self.state.lock();
        require_link(&mut state, "append_fdb", dev)?;
        if !state.fdb.entry(dev.to_string()).or_default().insert(*neighbor) {
            return Err(failed("append_fdb", "RTNETLINK answers: File exists"));
        }
        Ok(())
    }

    async fn del_fdb(&self, dev: &str, neighbor: &Neighbor) -> PeerlinkResult<()> {
        self.enter("del_fdb").await?;
        let mut state = self.state.lock();
        let removed = state
            .fdb
            .get_mut(dev)
            .map_or(false, |set| set.remove(neighbor));
        if !removed {
            return Err(failed("del_fdb", "RTNETLINK answers: No such file or directory"));
        }
        Ok(())
    }

    async fn list_routes(&self, table: TableId) -> PeerlinkResult<Vec<RouteEntry>> {
        self.enter("list_routes").await?;
        Ok(self.routes(table))
    }

    async fn add_route(&self, route: &RouteEntry) -> PeerlinkResult<()> {
        self.enter("add_route").await?;
        let mut state = self.state.lock();
        require_link(&mut state, "add_route", &route.device)?;
        if state.routes.iter().any(|r| r.same_destination(route)) {
            return Err(failed("add_route", "RTNETLINK answers: File exists"));
        }
        state.routes.insert(route.clone());
        Ok(())
    }

    async fn del_route(&self, route: &RouteEntry) -> PeerlinkResult<()> {
        self.enter("del_route").await?;
        let mut state = self.state.lock();
        let existing = state
            .routes
            .iter()
            .find(|r| {
                r.same_destination(route) && (route.gateway.is_none() || r.gateway == route.gateway)
            })
            .cloned();
        match existing {
            Some(r) => {
                state.routes.remove(&r);
                Ok(())
            }
            None => Err(failed("del_route", "RTNETLINK answers: No such process")),
        }
    }

    async fn list_rules(&self) -> PeerlinkResult<Vec<PolicyRule>> {
        self.enter("list_rules").await?;
        Ok(self.rules())
    }

    /// Like the kernel, accepts duplicate rules.
    async fn add_rule(&self, rule: &PolicyRule) -> PeerlinkResult<()> {
        self.enter("add_rule").await?;
        self.state.lock().rules.push(*rule);
        Ok(())
    }

    async fn del_rule(&self, rule: &PolicyRule) -> PeerlinkResult<()> {
        self.enter("del_rule").await?;
        let mut state = self.state.lock();
        match state.rules.iter().position(|r| r == rule) {
            Some(pos) => {
                state.rules.remove(pos);
                Ok(())
            }
            None => Err(failed("del_rule", "RTNETLINK answers: No such file or directory")),
        }
    }
}
