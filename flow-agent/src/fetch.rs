//! Loads the TC classifier object and owns its kernel-facing resources:
//! qdiscs, filters, the aggregated-flows map, the ring buffer and the perf
//! array. Map handles are taken out once by the pipeline producers; the
//! attach/teardown state stays here.

use std::{fs, io, path::Path, ptr, slice};

use anyhow::{Context, Result, anyhow};
use aya::{
    Ebpf, EbpfLoader,
    maps::{MapData, PerCpuHashMap, RingBuf, perf::AsyncPerfEventArray},
    programs::tc::{self, NlOptions, SchedClassifier, SchedClassifierLinkId, TcAttachOptions, TcAttachType},
};
use log::{debug, warn};

use crate::{
    ifaces::Interface,
    model::{FlowKey, FlowMetrics},
    netlink,
};

const AGGREGATED_FLOWS_MAP: &str = "aggregated_flows";
const DIRECT_FLOWS_MAP: &str = "direct_flows";
const PACKET_PAYLOADS_MAP: &str = "packet_payloads";

const INGRESS_PROGRAM: &str = "ingress_flow_parse";
const EGRESS_PROGRAM: &str = "egress_flow_parse";
const INGRESS_PANO_PROGRAM: &str = "ingress_pano_parse";

// Classifier slots on the clsact qdisc. The packet-capture variant sits at a
// second priority so both ingress filters can coexist.
const FILTER_HANDLE: u32 = 1;
const FILTER_PRIORITY: u16 = 1;
const PANO_FILTER_PRIORITY: u16 = 2;

struct AttachedFilter {
    iface: Interface,
    program: &'static str,
    link: SchedClassifierLinkId,
}

pub struct FlowFetcher {
    ebpf: Ebpf,
    enable_ingress: bool,
    enable_egress: bool,
    enable_pano: bool,
    filters: Vec<AttachedFilter>,
    qdiscs: Vec<Interface>,
}

impl FlowFetcher {
    /// Loads the classifier object, rewriting the kernel-side constants and
    /// resizing the aggregation map before load.
    pub fn new(
        object_path: &Path,
        trace_messages: bool,
        sampling: u32,
        cache_max_flows: u32,
        ingress: bool,
        egress: bool,
        pano: bool,
    ) -> Result<FlowFetcher> {
        lift_memlock_limit();

        let data = fs::read(object_path)
            .with_context(|| format!("reading eBPF object {}", object_path.display()))?;
        let aligned = align_object(&data);

        let trace: u8 = trace_messages.into();
        let mut ebpf = EbpfLoader::new()
            .set_global("sampling", &sampling, true)
            .set_global("trace_messages", &trace, true)
            .set_max_entries(AGGREGATED_FLOWS_MAP, cache_max_flows)
            .load(unsafe { slice::from_raw_parts(aligned.as_ptr() as *const u8, data.len()) })
            .context("loading eBPF object")?;

        let mut programs = Vec::new();
        if ingress {
            programs.push(INGRESS_PROGRAM);
        }
        if egress {
            programs.push(EGRESS_PROGRAM);
        }
        if pano {
            programs.push(INGRESS_PANO_PROGRAM);
        }
        for name in programs {
            classifier(&mut ebpf, name)?
                .load()
                .with_context(|| format!("loading program {name}"))?;
        }

        Ok(FlowFetcher {
            ebpf,
            enable_ingress: ingress,
            enable_egress: egress,
            enable_pano: pano,
            filters: Vec::new(),
            qdiscs: Vec::new(),
        })
    }

    /// Attaches the classifiers to one interface. A pre-existing qdisc or
    /// filter is reused; any other failure aborts the registration and the
    /// caller skips the interface.
    pub fn register(&mut self, iface: &Interface) -> Result<()> {
        match tc::qdisc_add_clsact(&iface.name) {
            Ok(()) => self.qdiscs.push(iface.clone()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                warn!("qdisc clsact already exists on {}, reusing it", iface.name);
                self.qdiscs.push(iface.clone());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("creating clsact qdisc on {}", iface.name));
            }
        }

        if self.enable_egress {
            self.attach(iface, EGRESS_PROGRAM, TcAttachType::Egress, FILTER_PRIORITY)?;
        } else {
            debug!("ignoring egress traffic on {} per configuration", iface.name);
        }
        if self.enable_ingress {
            self.attach(iface, INGRESS_PROGRAM, TcAttachType::Ingress, FILTER_PRIORITY)?;
            if self.enable_pano {
                self.attach(
                    iface,
                    INGRESS_PANO_PROGRAM,
                    TcAttachType::Ingress,
                    PANO_FILTER_PRIORITY,
                )?;
            }
        } else {
            debug!("ignoring ingress traffic on {} per configuration", iface.name);
        }
        Ok(())
    }

    fn attach(
        &mut self,
        iface: &Interface,
        program: &'static str,
        attach_type: TcAttachType,
        priority: u16,
    ) -> Result<()> {
        let prog = classifier(&mut self.ebpf, program)?;
        let options = TcAttachOptions::Netlink(NlOptions {
            handle: FILTER_HANDLE,
            priority,
        });
        match prog.attach_with_options(&iface.name, attach_type, options) {
            Ok(link) => {
                self.filters.push(AttachedFilter {
                    iface: iface.clone(),
                    program,
                    link,
                });
                Ok(())
            }
            Err(err) if source_is_eexist(&err) => {
                warn!("{program} filter already exists on {}, reusing it", iface.name);
                Ok(())
            }
            Err(err) => {
                Err(err).with_context(|| format!("attaching {program} on {}", iface.name))
            }
        }
    }

    pub fn take_flow_map(&mut self) -> Result<PerCpuHashMap<MapData, FlowKey, FlowMetrics>> {
        let map = self
            .ebpf
            .take_map(AGGREGATED_FLOWS_MAP)
            .ok_or_else(|| anyhow!("map {AGGREGATED_FLOWS_MAP} not found"))?;
        PerCpuHashMap::try_from(map).context("aggregated flows map has unexpected type")
    }

    pub fn take_ringbuf(&mut self) -> Result<RingBuf<MapData>> {
        let map = self
            .ebpf
            .take_map(DIRECT_FLOWS_MAP)
            .ok_or_else(|| anyhow!("map {DIRECT_FLOWS_MAP} not found"))?;
        RingBuf::try_from(map).context("direct flows map has unexpected type")
    }

    pub fn take_perf(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self
            .ebpf
            .take_map(PACKET_PAYLOADS_MAP)
            .ok_or_else(|| anyhow!("map {PACKET_PAYLOADS_MAP} not found"))?;
        AsyncPerfEventArray::try_from(map).context("packet payloads map has unexpected type")
    }

    /// Detaches every installed filter and removes the qdiscs, collecting
    /// errors instead of stopping at the first one.
    pub fn close(&mut self) -> Result<()> {
        debug!("unregistering eBPF objects");
        let mut errs: Vec<String> = Vec::new();

        for filter in self.filters.drain(..).collect::<Vec<_>>() {
            let result = classifier(&mut self.ebpf, filter.program)
                .and_then(|prog| prog.detach(filter.link).map_err(Into::into));
            if let Err(err) = result {
                errs.push(format!(
                    "detaching {} from {}: {err:#}",
                    filter.program, filter.iface.name
                ));
            }
        }
        for iface in self.qdiscs.drain(..) {
            if let Err(err) = netlink::NetlinkSocket::del_clsact_qdisc(iface.index) {
                errs.push(format!("deleting qdisc on {}: {err}", iface.name));
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("shutdown errors: {}", errs.join("; ")))
        }
    }
}

fn classifier<'e>(ebpf: &'e mut Ebpf, name: &str) -> Result<&'e mut SchedClassifier> {
    ebpf.program_mut(name)
        .ok_or_else(|| anyhow!("program {name} not found"))?
        .try_into()
        .with_context(|| format!("program {name} is not a TC classifier"))
}

/// Copies the object file into 8-byte-aligned storage. The ELF parser
/// rejects unaligned input and `fs::read` gives no alignment guarantee.
fn align_object(data: &[u8]) -> Vec<u64> {
    let mut aligned: Vec<u64> = vec![0; data.len().div_ceil(8)];
    unsafe {
        ptr::copy_nonoverlapping(data.as_ptr(), aligned.as_mut_ptr() as *mut u8, data.len());
    }
    aligned
}

/// Locked memory is needed for maps on pre-5.11 kernels.
fn lift_memlock_limit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if rc != 0 {
        debug!("can't remove memlock limit, loading eBPF objects may fail");
    }
}

/// Walks an error's source chain looking for EEXIST, which the attach path
/// treats as "already installed by a previous run".
fn source_is_eexist(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return io_err.raw_os_error() == Some(libc::EEXIST);
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_object_preserves_bytes() {
        let data: Vec<u8> = (0..29).collect();
        let aligned = align_object(&data);
        let view = unsafe { slice::from_raw_parts(aligned.as_ptr() as *const u8, data.len()) };
        assert_eq!(view, &data[..]);
        assert_eq!(aligned.as_ptr() as usize % 8, 0);
    }

    #[test]
    fn eexist_is_found_through_source_chains() {
        let io_err = io::Error::from_raw_os_error(libc::EEXIST);
        let wrapped = anyhow!(io_err).context("attaching filter");
        assert!(source_is_eexist(wrapped.as_ref()));

        let other = io::Error::from_raw_os_error(libc::EPERM);
        let wrapped = anyhow!(other).context("attaching filter");
        assert!(!source_is_eexist(wrapped.as_ref()));
    }
}
