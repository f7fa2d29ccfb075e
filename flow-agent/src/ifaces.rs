//! Interface discovery and registration.
//!
//! An informer backend (poller or watcher) publishes add/delete events for
//! network interfaces. The registrar consumes them, keeps the index-to-name
//! cache used by the decorator, filters names against the user's allow/deny
//! lists and attaches the TC programs for accepted interfaces.

use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::Path,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use regex::Regex;
use tokio::{io::unix::AsyncFd, sync::broadcast, time};
use tokio_util::sync::CancellationToken;

use crate::{error::StartupError, fetch::FlowFetcher, netlink};

/// Sentinel returned by name lookups for indexes the registrar has not seen.
pub const UNKNOWN_INTERFACE: &str = "unknown";

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Interface {
    pub index: u32,
    pub name: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Added(Interface),
    Deleted(Interface),
}

/// Enumerates the interfaces currently known to the kernel.
pub fn list_interfaces() -> io::Result<Vec<Interface>> {
    let mut interfaces = Vec::new();
    for entry in fs::read_dir("/sys/class/net")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(index) = read_ifindex(&entry.path()) {
            interfaces.push(Interface { index, name });
        }
    }
    Ok(interfaces)
}

fn read_ifindex(dir: &Path) -> Option<u32> {
    fs::read_to_string(dir.join("ifindex"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Informer backend. `subscribe` spawns the producing task and hands back the
/// event stream. The broadcast channel drops the oldest events on overflow;
/// the registrar recovers through the next poll cycle or re-added links.
pub enum Informer {
    Poll { period: Duration },
    Watch,
}

impl Informer {
    pub fn subscribe(
        &self,
        buffer: usize,
        cancel: CancellationToken,
    ) -> Result<broadcast::Receiver<Event>> {
        let (tx, rx) = broadcast::channel(buffer);
        match self {
            Informer::Poll { period } => {
                let period = *period;
                tokio::spawn(async move { poll_loop(period, tx, cancel).await });
            }
            Informer::Watch => {
                let socket =
                    netlink::NetlinkSocket::link_notifications().context("netlink subscribe")?;
                tokio::spawn(async move { watch_loop(socket, tx, cancel).await });
            }
        }
        Ok(rx)
    }
}

async fn poll_loop(period: Duration, tx: broadcast::Sender<Event>, cancel: CancellationToken) {
    let mut known: HashSet<Interface> = HashSet::new();
    let mut ticker = time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("interface poller exiting");
                return;
            }
            _ = ticker.tick() => {
                let current: HashSet<Interface> = match list_interfaces() {
                    Ok(list) => list.into_iter().collect(),
                    Err(err) => {
                        warn!("can't enumerate interfaces: {err}");
                        continue;
                    }
                };
                for iface in current.difference(&known) {
                    let _ = tx.send(Event::Added(iface.clone()));
                }
                for iface in known.difference(&current) {
                    let _ = tx.send(Event::Deleted(iface.clone()));
                }
                known = current;
            }
        }
    }
}

async fn watch_loop(
    socket: netlink::NetlinkSocket,
    tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
) {
    // Links that existed before the subscription never produce a
    // notification, so bootstrap from a full enumeration.
    let mut known: HashSet<u32> = HashSet::new();
    match list_interfaces() {
        Ok(list) => {
            for iface in list {
                known.insert(iface.index);
                let _ = tx.send(Event::Added(iface));
            }
        }
        Err(err) => warn!("can't bootstrap interface list: {err}"),
    }

    let fd = match AsyncFd::new(socket) {
        Ok(fd) => fd,
        Err(err) => {
            warn!("can't poll netlink socket: {err}");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("interface watcher exiting");
                return;
            }
            guard = fd.readable() => {
                let mut guard = match guard {
                    Ok(guard) => guard,
                    Err(err) => {
                        warn!("netlink poll error: {err}");
                        return;
                    }
                };
                loop {
                    match guard.get_inner().recv_link_events() {
                        Ok(events) => {
                            for event in events {
                                forward_link_event(event, &mut known, &tx);
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            guard.clear_ready();
                            break;
                        }
                        Err(err) => {
                            warn!("reading link notifications: {err}");
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn forward_link_event(
    event: netlink::LinkEvent,
    known: &mut HashSet<u32>,
    tx: &broadcast::Sender<Event>,
) {
    match event {
        netlink::LinkEvent::New(iface) => {
            // Kernels re-announce links on any state change; only the first
            // sighting of an index becomes an Added event.
            if known.insert(iface.index) {
                let _ = tx.send(Event::Added(iface));
            }
        }
        netlink::LinkEvent::Del(iface) => {
            if known.remove(&iface.index) {
                let _ = tx.send(Event::Deleted(iface));
            }
        }
    }
}

/// Allow/deny interface-name filter. Items are literal names or
/// slash-delimited regular expressions.
pub struct InterfaceFilter {
    allowed: Vec<Matcher>,
    excluded: Vec<Matcher>,
}

enum Matcher {
    Literal(String),
    Pattern(Regex),
}

impl Matcher {
    fn parse(item: &str) -> Result<Matcher, StartupError> {
        let item = item.trim();
        if let Some(inner) = item
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            let re = Regex::new(inner).map_err(|err| {
                StartupError::Config(format!("invalid interface pattern {item}: {err}"))
            })?;
            Ok(Matcher::Pattern(re))
        } else {
            Ok(Matcher::Literal(item.to_string()))
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Matcher::Literal(lit) => lit == name,
            Matcher::Pattern(re) => re.is_match(name),
        }
    }
}

impl InterfaceFilter {
    pub fn new(allowed: &[String], excluded: &[String]) -> Result<InterfaceFilter, StartupError> {
        Ok(InterfaceFilter {
            allowed: allowed
                .iter()
                .map(|i| Matcher::parse(i))
                .collect::<Result<_, _>>()?,
            excluded: excluded
                .iter()
                .map(|i| Matcher::parse(i))
                .collect::<Result<_, _>>()?,
        })
    }

    /// An empty allow-list accepts everything; the deny-list is applied
    /// afterwards.
    pub fn allowed(&self, name: &str) -> bool {
        if !self.allowed.is_empty() && !self.allowed.iter().any(|m| m.matches(name)) {
            return false;
        }
        !self.excluded.iter().any(|m| m.matches(name))
    }
}

/// Index-to-name cache written by the registrar task and read by the
/// decorator. Single writer, many readers.
#[derive(Clone, Default)]
pub struct NameCache {
    names: Arc<RwLock<HashMap<u32, String>>>,
}

impl NameCache {
    pub fn name_for_index(&self, index: u32) -> String {
        self.names
            .read()
            .expect("interface name cache poisoned")
            .get(&index)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_INTERFACE.to_string())
    }

    fn insert(&self, iface: &Interface) {
        self.names
            .write()
            .expect("interface name cache poisoned")
            .insert(iface.index, iface.name.clone());
    }

    fn remove(&self, index: u32) {
        self.names
            .write()
            .expect("interface name cache poisoned")
            .remove(&index);
    }
}

/// Consumes informer events: caches names, filters, attaches programs for
/// accepted interfaces. Delete events are informational only, the kernel
/// drops qdiscs and filters together with the link.
pub async fn run_registrar(
    mut events: broadcast::Receiver<Event>,
    filter: InterfaceFilter,
    fetcher: Arc<Mutex<FlowFetcher>>,
    names: NameCache,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("registrar exiting");
                return;
            }
            event = events.recv() => match event {
                Ok(Event::Added(iface)) => {
                    names.insert(&iface);
                    if !filter.allowed(&iface.name) {
                        debug!(
                            "interface {} does not match the allow/exclusion filters, ignoring",
                            iface.name
                        );
                        continue;
                    }
                    info!("interface {} (index {}) detected, registering", iface.name, iface.index);
                    let result = fetcher
                        .lock()
                        .expect("flow fetcher mutex poisoned")
                        .register(&iface);
                    if let Err(err) = result {
                        warn!("can't register interface {}: {err:#}", iface.name);
                    }
                }
                Ok(Event::Deleted(iface)) => {
                    debug!("interface {} (index {}) deleted", iface.name, iface.index);
                    names.remove(iface.index);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("interface events overflowed, {missed} oldest dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(allow: &[&str], deny: &[&str]) -> InterfaceFilter {
        let allow: Vec<String> = allow.iter().map(|s| s.to_string()).collect();
        let deny: Vec<String> = deny.iter().map(|s| s.to_string()).collect();
        InterfaceFilter::new(&allow, &deny).unwrap()
    }

    #[test]
    fn empty_allow_list_accepts_everything() {
        let f = filter(&[], &[]);
        assert!(f.allowed("eth0"));
        assert!(f.allowed("veth12ab34"));
    }

    #[test]
    fn literal_allow_list_is_exact() {
        let f = filter(&["eth0"], &[]);
        assert!(f.allowed("eth0"));
        assert!(!f.allowed("eth1"));
        assert!(!f.allowed("eth0.100"));
    }

    #[test]
    fn deny_list_is_checked_after_allow() {
        let f = filter(&["/^eth/"], &["eth1"]);
        assert!(f.allowed("eth0"));
        assert!(!f.allowed("eth1"));
        assert!(!f.allowed("lo"));
    }

    #[test]
    fn regex_items_use_slash_delimiters() {
        let f = filter(&[], &["/^veth/"]);
        assert!(f.allowed("eth0"));
        assert!(!f.allowed("veth12ab34"));
    }

    #[test]
    fn invalid_regex_is_a_startup_error() {
        let items = vec!["/(/".to_string()];
        assert!(InterfaceFilter::new(&items, &[]).is_err());
    }

    #[test]
    fn name_cache_returns_sentinel_on_miss() {
        let cache = NameCache::default();
        assert_eq!(cache.name_for_index(42), UNKNOWN_INTERFACE);
        cache.insert(&Interface {
            index: 42,
            name: "eth0".to_string(),
        });
        assert_eq!(cache.name_for_index(42), "eth0");
        cache.remove(42);
        assert_eq!(cache.name_for_index(42), UNKNOWN_INTERFACE);
    }

    #[test]
    fn watcher_dedups_link_reannouncements() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut known = HashSet::new();
        let iface = Interface {
            index: 3,
            name: "eth0".to_string(),
        };
        forward_link_event(netlink::LinkEvent::New(iface.clone()), &mut known, &tx);
        forward_link_event(netlink::LinkEvent::New(iface.clone()), &mut known, &tx);
        forward_link_event(netlink::LinkEvent::Del(iface.clone()), &mut known, &tx);

        assert_eq!(rx.try_recv().unwrap(), Event::Added(iface.clone()));
        assert_eq!(rx.try_recv().unwrap(), Event::Deleted(iface));
        assert!(rx.try_recv().is_err());
    }
}
