// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Record of the API calls that produced every live Vulkan object, replayed in dependency
//! order after a snapshot load.
//!
//! Each handle has a BEGIN and a CREATED state.  Calls that create a handle are attached to one
//! of its states; `add_handle_dependency` orders states of different handles.  Calls that
//! mutate an existing handle go to a separate modification list and are replayed after every
//! create, ordered by when the handle was first modified.

use std::collections::BTreeMap as Map;
use std::collections::BTreeSet;
use std::collections::HashSet;

use log::debug;
use log::warn;

use crate::gfxstream_utils::GfxstreamError;
use crate::gfxstream_utils::GfxstreamResult;

const HANDLE_TYPE_SHIFT: u32 = 48;

/// Builds a handle whose top 16 bits carry the object type.
pub fn make_handle(type_tag: u16, index: u64) -> u64 {
    ((type_tag as u64) << HANDLE_TYPE_SHIFT) | (index & ((1 << HANDLE_TYPE_SHIFT) - 1))
}

pub fn handle_type_tag(handle: u64) -> u16 {
    (handle >> HANDLE_TYPE_SHIFT) as u16
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandleState {
    Begin = 0,
    Created = 1,
}

const HANDLE_STATES: [HandleState; 2] = [HandleState::Begin, HandleState::Created];

pub type HandleWithState = (u64, HandleState);
pub type ApiHandle = u64;

#[derive(Clone, Debug, Default)]
pub struct ApiCallInfo {
    /// `{opcode, 8 + payload length, payload}` without any checksum trailer.
    pub packet: Vec<u8>,
    pub created_handles: Vec<u64>,
    /// Handles whose modification list holds this call.
    modify_refs: usize,
}

impl ApiCallInfo {
    fn is_unreferenced(&self) -> bool {
        self.created_handles.is_empty() && self.modify_refs == 0
    }
}

#[derive(Clone, Debug, Default)]
struct StateReconstruction {
    parents: Vec<HandleWithState>,
    children: BTreeSet<HandleWithState>,
    api_refs: Vec<ApiHandle>,
}

#[derive(Clone, Debug, Default)]
struct HandleReconstruction {
    states: [StateReconstruction; 2],
    destroying: bool,
    delayed_destroy: bool,
}

impl HandleReconstruction {
    fn has_children(&self) -> bool {
        self.states.iter().any(|s| !s.children.is_empty())
    }
}

#[derive(Clone, Debug, Default)]
struct HandleModification {
    order: u64,
    api_refs: Vec<ApiHandle>,
}

#[derive(Default)]
pub struct VkReconstruction {
    api_calls: Map<ApiHandle, ApiCallInfo>,
    next_api: ApiHandle,
    handles: Map<u64, HandleReconstruction>,
    modifications: Map<u64, HandleModification>,
    next_order: u64,
}

impl VkReconstruction {
    pub fn new() -> VkReconstruction {
        Default::default()
    }

    pub fn clear(&mut self) {
        self.api_calls.clear();
        self.handles.clear();
        self.modifications.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty() && self.modifications.values().all(|m| m.api_refs.is_empty())
    }

    pub fn live_handles(&self) -> Vec<u64> {
        self.handles.keys().copied().collect()
    }

    pub fn create_api_call_info(&mut self) -> ApiHandle {
        self.next_api += 1;
        self.api_calls.insert(self.next_api, Default::default());
        self.next_api
    }

    pub fn api_call_info(&self, api: ApiHandle) -> Option<&ApiCallInfo> {
        self.api_calls.get(&api)
    }

    pub fn set_api_trace(&mut self, api: ApiHandle, packet: &[u8]) {
        if let Some(info) = self.api_calls.get_mut(&api) {
            info.packet = packet.to_vec();
        }
    }

    pub fn set_created_handles_for_api(&mut self, api: ApiHandle, created: &[u64]) {
        if let Some(info) = self.api_calls.get_mut(&api) {
            info.created_handles.extend_from_slice(created);
        }
    }

    /// Drops a call that never got a packet attached.
    pub fn destroy_api_call_info_if_unused(&mut self, api: ApiHandle) {
        if matches!(self.api_calls.get(&api), Some(info) if info.packet.is_empty()) {
            self.api_calls.remove(&api);
        }
    }

    pub fn add_handles(&mut self, handles: &[u64]) {
        for handle in handles {
            debug!("reconstruction: add {:#x}", handle);
            self.handles.insert(*handle, Default::default());
        }
    }

    /// Forgets `handles`.  A non-recursive removal of a handle that still has children only marks
    /// it for delayed destruction; it is dropped once its last child goes away.
    pub fn remove_handles(&mut self, handles: &[u64], recursive: bool) {
        for handle in handles {
            let item = match self.handles.get_mut(handle) {
                // Parents may already have taken their children with them.
                None => continue,
                Some(item) => item,
            };
            if item.destroying {
                continue;
            }
            item.destroying = true;

            if !recursive && item.has_children() {
                debug!("reconstruction: delaying destroy of {:#x}", handle);
                item.delayed_destroy = true;
                item.destroying = false;
                continue;
            }

            let mut created_children = Vec::new();
            for state in HANDLE_STATES {
                let item = match self.handles.get_mut(handle) {
                    Some(item) => item,
                    None => break,
                };
                let slot = &mut item.states[state as usize];
                let parents = std::mem::take(&mut slot.parents);
                let children = std::mem::take(&mut slot.children);

                for (parent, parent_state) in parents {
                    if let Some(p) = self.handles.get_mut(&parent) {
                        p.states[parent_state as usize]
                            .children
                            .remove(&(*handle, state));
                    }
                }
                for (child, child_state) in children {
                    if let Some(c) = self.handles.get_mut(&child) {
                        c.states[child_state as usize]
                            .parents
                            .retain(|p| *p != (*handle, state));
                    }
                    if child_state == HandleState::Created {
                        created_children.push(child);
                    }
                }
            }

            if !created_children.is_empty() {
                self.remove_handles(&created_children, true);
            }
            self.for_each_handle_delete_api(&[*handle]);
            let removed = self.handles.remove(handle);
            self.modifications.remove(handle);

            // Finish any parent that was waiting on this handle.
            let orphaned_parents: Vec<u64> = removed
                .iter()
                .flat_map(|r| r.states.iter())
                .flat_map(|s| s.parents.iter().map(|p| p.0))
                .collect();
            self.destroy_delayed(&orphaned_parents);
        }
    }

    fn destroy_delayed(&mut self, candidates: &[u64]) {
        let ready: Vec<u64> = candidates
            .iter()
            .copied()
            .filter(|h| {
                self.handles
                    .get(h)
                    .map(|item| item.delayed_destroy && !item.has_children())
                    .unwrap_or(false)
            })
            .collect();
        if !ready.is_empty() {
            self.remove_handles(&ready, false);
        }
    }

    pub fn for_each_handle_add_api(&mut self, handles: &[u64], api: ApiHandle, state: HandleState) {
        for handle in handles {
            if let Some(item) = self.handles.get_mut(handle) {
                item.states[state as usize].api_refs.push(api);
            }
        }
    }

    /// Detaches `handles` from the calls that created them.  A call is dropped once it no
    /// longer creates any live handle.
    pub fn for_each_handle_delete_api(&mut self, handles: &[u64]) {
        for handle in handles {
            let item = match self.handles.get_mut(handle) {
                Some(item) => item,
                None => continue,
            };

            let mut refs = Vec::new();
            for state in item.states.iter_mut() {
                refs.append(&mut state.api_refs);
            }

            for api in refs {
                if let Some(info) = self.api_calls.get_mut(&api) {
                    if let Some(pos) = info.created_handles.iter().position(|h| h == handle) {
                        info.created_handles.remove(pos);
                    }
                    if info.is_unreferenced() {
                        self.api_calls.remove(&api);
                    }
                }
            }
        }
        self.for_each_handle_clear_modify_api(handles);
    }

    /// Makes `child_state` of every handle in `children` depend on `parent_state` of `parent`.
    pub fn add_handle_dependency(
        &mut self,
        children: &[u64],
        parent: u64,
        child_state: HandleState,
        parent_state: HandleState,
    ) {
        if parent == 0 {
            return;
        }
        if !self.handles.contains_key(&parent) {
            warn!("reconstruction: dependency on unknown parent {:#x}", parent);
            return;
        }

        for child in children {
            let child_item = match self.handles.get_mut(child) {
                Some(item) => item,
                None => continue,
            };
            child_item.states[child_state as usize]
                .parents
                .push((parent, parent_state));
            if let Some(parent_item) = self.handles.get_mut(&parent) {
                parent_item.states[parent_state as usize]
                    .children
                    .insert((*child, child_state));
            }
        }
    }

    pub fn for_each_handle_add_modify_api(&mut self, handles: &[u64], api: ApiHandle) {
        for handle in handles {
            let next_order = &mut self.next_order;
            let modification = self.modifications.entry(*handle).or_insert_with(|| {
                *next_order += 1;
                HandleModification {
                    order: *next_order,
                    api_refs: Vec::new(),
                }
            });
            modification.api_refs.push(api);
            if let Some(info) = self.api_calls.get_mut(&api) {
                info.modify_refs += 1;
            }
        }
    }

    /// Drops the modification calls recorded against `handles`.  A call is dropped once no
    /// handle refers to it.
    pub fn for_each_handle_clear_modify_api(&mut self, handles: &[u64]) {
        for handle in handles {
            let refs = match self.modifications.get_mut(handle) {
                Some(modification) => std::mem::take(&mut modification.api_refs),
                None => continue,
            };
            for api in refs {
                if let Some(info) = self.api_calls.get_mut(&api) {
                    info.modify_refs = info.modify_refs.saturating_sub(1);
                    if info.is_unreferenced() {
                        self.api_calls.remove(&api);
                    }
                }
            }
        }
    }

    pub fn api_call_count(&self) -> usize {
        self.api_calls.len()
    }

    /// Create calls in dependency order.  Ties are broken by state, object type, then handle.
    fn ordered_create_apis(&self) -> Vec<ApiHandle> {
        let mut in_degree: Map<HandleWithState, usize> = Map::new();
        let mut next: Vec<HandleWithState> = Vec::new();
        for (handle, item) in &self.handles {
            for state in HANDLE_STATES {
                let parents = item.states[state as usize].parents.len();
                in_degree.insert((*handle, state), parents);
                if parents == 0 {
                    next.push((*handle, state));
                }
            }
        }

        let mut saved: HashSet<ApiHandle> = HashSet::new();
        let mut ordered = Vec::new();
        let mut visited = 0;
        while !next.is_empty() {
            next.sort_by_key(|(handle, state)| (*state, handle_type_tag(*handle), *handle));
            let level = std::mem::take(&mut next);
            visited += level.len();

            for (handle, state) in &level {
                let slot = match self.handles.get(handle) {
                    Some(item) => &item.states[*state as usize],
                    None => continue,
                };

                for api in &slot.api_refs {
                    if self.api_calls.contains_key(api) && saved.insert(*api) {
                        ordered.push(*api);
                    }
                }

                for child in &slot.children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(*child);
                        }
                    }
                }
            }
        }

        if visited != in_degree.len() {
            warn!(
                "reconstruction: {} handle states are part of a cycle and were skipped",
                in_degree.len() - visited
            );
        }
        ordered
    }

    fn ordered_unique_modify_apis(&self) -> Vec<ApiHandle> {
        let mut modifications: Vec<&HandleModification> = self.modifications.values().collect();
        modifications.sort_by_key(|m| m.order);

        let mut used = HashSet::new();
        modifications
            .iter()
            .flat_map(|m| m.api_refs.iter().copied())
            .filter(|api| self.api_calls.contains_key(api) && used.insert(*api))
            .collect()
    }

    /// `[created handle count u32][created handles u64 x N][api trace]`, host-native endian.
    pub fn save_replay_buffers(&self) -> Vec<u8> {
        let mut apis = self.ordered_create_apis();
        apis.extend(self.ordered_unique_modify_apis());

        let infos: Vec<&ApiCallInfo> = apis.iter().filter_map(|a| self.api_calls.get(a)).collect();
        let created: Vec<u64> = infos
            .iter()
            .flat_map(|info| info.created_handles.iter().copied())
            .collect();

        let mut out = Vec::new();
        out.extend_from_slice(&(created.len() as u32).to_ne_bytes());
        for handle in &created {
            out.extend_from_slice(&handle.to_ne_bytes());
        }
        for info in infos {
            out.extend_from_slice(&info.packet);
        }

        debug!(
            "reconstruction: saved {} calls creating {} handles",
            apis.len(),
            created.len()
        );
        out
    }

    /// Splits a buffer produced by `save_replay_buffers` into created handles and the trace.
    pub fn load_replay_buffers(buf: &[u8]) -> GfxstreamResult<(Vec<u64>, Vec<u8>)> {
        let mismatch = || GfxstreamError::SnapshotMismatch("truncated replay buffer".to_string());

        let count_bytes = buf.get(..4).ok_or_else(mismatch)?;
        let count = u32::from_ne_bytes(count_bytes.try_into().map_err(|_| mismatch())?) as usize;
        let handles_end = count
            .checked_mul(8)
            .and_then(|n| n.checked_add(4))
            .ok_or_else(mismatch)?;
        let handle_bytes = buf.get(4..handles_end).ok_or_else(mismatch)?;

        let handles = handle_bytes
            .chunks_exact(8)
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                u64::from_ne_bytes(raw)
            })
            .collect();

        Ok((handles, buf[handles_end..].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PacketHeader;
    use crate::wire::PACKET_HEADER_SIZE;
    use zerocopy::AsBytes;

    const TYPE_MEMORY: u16 = 3;
    const TYPE_BUFFER: u16 = 4;

    fn packet(opcode: u32) -> Vec<u8> {
        let mut p = PacketHeader::new(opcode, 12).as_bytes().to_vec();
        p.extend_from_slice(&opcode.to_le_bytes());
        p
    }

    fn record_create(r: &mut VkReconstruction, opcode: u32, handle: u64) -> ApiHandle {
        let api = r.create_api_call_info();
        r.set_api_trace(api, &packet(opcode));
        r.add_handles(&[handle]);
        r.for_each_handle_add_api(&[handle], api, HandleState::Created);
        r.set_created_handles_for_api(api, &[handle]);
        api
    }

    fn opcodes(trace: &[u8]) -> Vec<u32> {
        let mut out = Vec::new();
        let mut rest = trace;
        while !rest.is_empty() {
            let header = PacketHeader::read(rest).unwrap();
            assert!(header.packet_len() >= PACKET_HEADER_SIZE);
            out.push(header.opcode());
            rest = &rest[header.packet_len()..];
        }
        out
    }

    #[test]
    fn empty_session_saves_empty_trace() {
        let r = VkReconstruction::new();
        let buf = r.save_replay_buffers();
        let (handles, trace) = VkReconstruction::load_replay_buffers(&buf).unwrap();
        assert!(handles.is_empty());
        assert!(trace.is_empty());
    }

    #[test]
    fn parents_are_replayed_before_children_then_modifies() {
        let mut r = VkReconstruction::new();
        // The child gets the lower handle value to prove ordering is not by value.
        let b2 = make_handle(TYPE_BUFFER, 1);
        let b1 = make_handle(TYPE_MEMORY, 2);

        record_create(&mut r, 200, b2);
        record_create(&mut r, 100, b1);
        r.add_handle_dependency(&[b2], b1, HandleState::Created, HandleState::Created);

        let modify = r.create_api_call_info();
        r.set_api_trace(modify, &packet(300));
        r.for_each_handle_add_modify_api(&[b2], modify);

        let (handles, trace) =
            VkReconstruction::load_replay_buffers(&r.save_replay_buffers()).unwrap();
        assert_eq!(handles, vec![b1, b2]);
        assert_eq!(opcodes(&trace), vec![100, 200, 300]);
    }

    #[test]
    fn recursive_removal_takes_created_children() {
        let mut r = VkReconstruction::new();
        let parent = make_handle(TYPE_MEMORY, 1);
        let child = make_handle(TYPE_BUFFER, 2);
        record_create(&mut r, 1, parent);
        record_create(&mut r, 2, child);
        r.add_handle_dependency(&[child], parent, HandleState::Created, HandleState::Created);

        r.remove_handles(&[parent], true);
        assert!(r.live_handles().is_empty());
        assert!(r.is_empty());
        let (handles, trace) =
            VkReconstruction::load_replay_buffers(&r.save_replay_buffers()).unwrap();
        assert!(handles.is_empty());
        assert!(trace.is_empty());
    }

    #[test]
    fn non_recursive_removal_is_delayed_until_children_go() {
        let mut r = VkReconstruction::new();
        let parent = make_handle(TYPE_MEMORY, 1);
        let child = make_handle(TYPE_BUFFER, 2);
        record_create(&mut r, 1, parent);
        record_create(&mut r, 2, child);
        r.add_handle_dependency(&[child], parent, HandleState::Created, HandleState::Created);

        r.remove_handles(&[parent], false);
        assert_eq!(r.live_handles().len(), 2);

        r.remove_handles(&[child], false);
        assert!(r.live_handles().is_empty());
    }

    #[test]
    fn shared_create_call_survives_until_last_handle() {
        let mut r = VkReconstruction::new();
        let a = make_handle(TYPE_BUFFER, 1);
        let b = make_handle(TYPE_BUFFER, 2);
        let api = r.create_api_call_info();
        r.set_api_trace(api, &packet(9));
        r.add_handles(&[a, b]);
        r.for_each_handle_add_api(&[a, b], api, HandleState::Created);
        r.set_created_handles_for_api(api, &[a, b]);

        r.remove_handles(&[a], true);
        assert_eq!(r.api_call_info(api).unwrap().created_handles, vec![b]);
        r.remove_handles(&[b], true);
        assert!(r.api_call_info(api).is_none());
    }

    #[test]
    fn modify_calls_are_dropped_with_their_last_handle() {
        let mut r = VkReconstruction::new();
        let memory = make_handle(TYPE_MEMORY, 1);
        let a = make_handle(TYPE_BUFFER, 2);
        let b = make_handle(TYPE_BUFFER, 3);
        record_create(&mut r, 1, memory);
        record_create(&mut r, 2, a);
        record_create(&mut r, 3, b);

        let bind_both = r.create_api_call_info();
        r.set_api_trace(bind_both, &packet(10));
        r.for_each_handle_add_modify_api(&[a, b], bind_both);
        let bind_a = r.create_api_call_info();
        r.set_api_trace(bind_a, &packet(11));
        r.for_each_handle_add_modify_api(&[a], bind_a);
        assert_eq!(r.api_call_count(), 5);

        r.for_each_handle_clear_modify_api(&[a]);
        assert!(r.api_call_info(bind_a).is_none());
        assert!(r.api_call_info(bind_both).is_some());

        r.remove_handles(&[b], true);
        assert!(r.api_call_info(bind_both).is_none());
        assert_eq!(r.api_call_count(), 2);

        // Many bind and destroy cycles leave nothing behind.
        for i in 0..100 {
            let buffer = make_handle(TYPE_BUFFER, 100 + i);
            record_create(&mut r, 4, buffer);
            let bind = r.create_api_call_info();
            r.set_api_trace(bind, &packet(12));
            r.for_each_handle_add_modify_api(&[buffer], bind);
            r.remove_handles(&[buffer], true);
        }
        assert_eq!(r.api_call_count(), 2);

        let (_, trace) = VkReconstruction::load_replay_buffers(&r.save_replay_buffers()).unwrap();
        assert_eq!(opcodes(&trace), vec![1, 2]);
    }

    #[test]
    fn handle_tags() {
        let h = make_handle(7, 42);
        assert_eq!(handle_type_tag(h), 7);
        assert_eq!(h & 0xffff, 42);
    }
}
