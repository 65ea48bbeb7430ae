//! Batch allocation: one call turns a slice of descriptors into buffers.
//!
//! When every descriptor resolves to the same heap and allocation flags, a
//! single allocation backs the whole batch: the largest descriptor (first
//! one on ties) is allocated in full and the others receive a duplicate of
//! its primary plane fd. Otherwise each descriptor is allocated on its own,
//! plane by plane, with HFR descriptors turned into merged containers.
//!
//! Any failure drops the buffers built so far, which closes their fds.

use crate::afbc;
use crate::buffer::{AllocatedBuffer, BufferParts};
use crate::catalog::Session;
use crate::config::PlatformConfig;
use crate::container;
use crate::descriptor::{AuxPlane, BufferDescriptor};
use crate::engine::{self, PlaneAllocation};
use crate::error::{Error, Result};
use crate::heap::{AllocFlags, HeapType, PrivateFlags};
use crate::kernel::PlaneFd;
use crate::policy::{self, HeapSelection};
use crate::usage::UsageBits;

/// Buffers produced by one batch.
#[derive(Debug)]
pub struct Allocation {
    /// One buffer per descriptor, in descriptor order.
    pub buffers: Vec<AllocatedBuffer>,
    /// Whether the batch shares one backing allocation.
    pub shared: bool,
}

/// Whether `descriptors` can share one backing allocation.
///
/// Needs at least two descriptors, all selecting the same heap with the same
/// allocation flags. A descriptor the policy rejects disables sharing.
pub fn can_share(descriptors: &[BufferDescriptor], platform: &PlatformConfig) -> bool {
    if descriptors.len() < 2 {
        return false;
    }
    let mut selections = descriptors.iter().map(|d| policy::select(d.usage, platform));
    let Some(Ok(first)) = selections.next() else {
        return false;
    };
    selections.all(|s| s.is_ok_and(|s| s.is_compatible(&first)))
}

/// Index of the descriptor that backs a shared batch: the largest total
/// size, first occurrence on ties.
pub fn representative(descriptors: &[BufferDescriptor]) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (i, d) in descriptors.iter().enumerate() {
        let size = d.total_size();
        if best.is_none_or(|(_, s)| size > s) {
            best = Some((i, size));
        }
    }
    best.map(|(i, _)| i)
}

/// Allocate every descriptor, sharing when possible.
///
/// On success each descriptor's `aux_plane` and `fd_count` are filled in.
pub fn allocate(session: &Session, descriptors: &mut [BufferDescriptor]) -> Result<Allocation> {
    if descriptors.is_empty() {
        return Err(Error::InvalidArgument("no descriptors".into()));
    }
    let config = session.config();
    for d in descriptors.iter() {
        d.validate(config)?;
    }

    let selections = descriptors
        .iter()
        .map(|d| policy::select(d.usage, &config.platform))
        .collect::<Result<Vec<_>>>()?;

    let shared = can_share(descriptors, &config.platform);
    let buffers = if shared {
        allocate_shared(session, descriptors, &selections)?
    } else {
        descriptors
            .iter()
            .zip(&selections)
            .map(|(d, s)| allocate_one(session, d, s, false))
            .collect::<Result<Vec<_>>>()?
    };

    for (d, b) in descriptors.iter_mut().zip(&buffers) {
        d.aux_plane = b.aux_plane();
        d.fd_count = b.fd_count();
    }
    Ok(Allocation { buffers, shared })
}

fn allocate_shared(
    session: &Session,
    descriptors: &[BufferDescriptor],
    selections: &[HeapSelection],
) -> Result<Vec<AllocatedBuffer>> {
    let rep = representative(descriptors)
        .ok_or_else(|| Error::InvalidArgument("no descriptors".into()))?;
    let primary = allocate_one(session, &descriptors[rep], &selections[rep], true)?;
    let primary_fd = primary
        .plane_fd(0)
        .ok_or_else(|| Error::AllocationFailed("representative has no primary plane".into()))?;
    let primary_size = primary.plane_size(0);
    tracing::debug!(representative = rep, count = descriptors.len(), "sharing one allocation");

    let mut dups = Vec::with_capacity(descriptors.len());
    for (i, (d, s)) in descriptors.iter().zip(selections).enumerate() {
        if i == rep {
            dups.push(None);
            continue;
        }
        let fd = session.kernel().dup(primary_fd).map_err(|e| {
            Error::DuplicationFailed(format!("descriptor {}: {}", i, e))
        })?;
        let aux = allocate_aux(session, d)?;
        dups.push(Some(AllocatedBuffer::from_parts(
            session.clone(),
            BufferParts {
                planes: vec![(PlaneFd::new(fd), primary_size)],
                aux,
                flags: policy::private_flags(d.usage, primary.heap())
                    | (primary.flags() & PrivateFlags::SYSTEM_FALLBACK)
                    | hfr_flag(d)
                    | PrivateFlags::SHARED,
                alloc_flags: s.alloc_flags,
                heap: primary.heap(),
                min_page_size: primary.min_page_size(),
                format: d.format,
                width: d.width,
                height: d.height,
                layer_count: d.layer_count,
                usage: d.usage,
            },
        )));
    }

    let mut primary = Some(primary);
    Ok(dups
        .into_iter()
        .filter_map(|b| b.or_else(|| primary.take()))
        .collect())
}

fn hfr_flag(desc: &BufferDescriptor) -> PrivateFlags {
    if desc.is_hfr {
        PrivateFlags::HFR_MODE
    } else {
        PrivateFlags::empty()
    }
}

/// Allocate one descriptor's image planes and auxiliary plane.
fn allocate_one(
    session: &Session,
    desc: &BufferDescriptor,
    selection: &HeapSelection,
    shared: bool,
) -> Result<AllocatedBuffer> {
    let batch = session.config().hfr_batch_size;

    let mut planes: Vec<PlaneAllocation> = Vec::with_capacity(desc.plane_count());
    for &size in &desc.plane_sizes {
        let plane = if desc.is_hfr {
            container::allocate_container(
                session,
                desc.usage,
                size,
                selection.heap,
                selection.alloc_flags,
                batch,
            )?
        } else {
            engine::allocate(
                session,
                desc.usage,
                size,
                selection.heap,
                selection.alloc_flags,
            )?
        };
        planes.push(plane);
    }

    let heap = planes.first().map_or(selection.heap, |p| p.heap);
    let min_page_size = planes.first().map_or(0, |p| p.min_page_size);
    let mut flags = policy::private_flags(desc.usage, heap) | hfr_flag(desc);
    if planes.iter().any(|p| p.fell_back) {
        flags |= PrivateFlags::SYSTEM_FALLBACK;
    }
    if shared {
        flags |= PrivateFlags::SHARED;
    }

    let scale = if desc.is_hfr { batch } else { 1 };
    let planes: Vec<(PlaneFd, usize)> = planes
        .into_iter()
        .zip(&desc.plane_sizes)
        .map(|(p, &size)| (p.fd, size * scale))
        .collect();

    if desc.format.is_afbc()
        && !shared
        && !desc.is_hfr
        && !selection.alloc_flags.contains(AllocFlags::PROTECTED)
    {
        for (fd, size) in &planes {
            afbc::init_plane(session, fd, *size, desc.width, desc.height, desc.layer_count)?;
        }
    }

    let aux = allocate_aux(session, desc)?;
    let buffer = AllocatedBuffer::from_parts(
        session.clone(),
        BufferParts {
            planes,
            aux,
            flags,
            alloc_flags: selection.alloc_flags,
            heap,
            min_page_size,
            format: desc.format,
            width: desc.width,
            height: desc.height,
            layer_count: desc.layer_count,
            usage: desc.usage,
        },
    );
    tracing::debug!(
        fds = ?buffer.fds(),
        heap = %heap,
        shared,
        "built buffer"
    );
    Ok(buffer)
}

/// The auxiliary plane always comes from the system heap, with no retry on
/// a secure heap.
fn allocate_aux(session: &Session, desc: &BufferDescriptor) -> Result<Option<(AuxPlane, PlaneFd)>> {
    let Some(aux) = desc.required_aux_plane(session.config()) else {
        return Ok(None);
    };
    let plane = engine::allocate(
        session,
        desc.usage.difference(UsageBits::PROTECTED_DPB),
        aux.size,
        HeapType::System,
        AllocFlags::empty(),
    )?;
    tracing::debug!(
        kind = ?aux.kind,
        index = aux.index,
        fd = plane.fd.raw(),
        "allocated auxiliary plane"
    );
    Ok(Some((aux, plane.fd)))
}
