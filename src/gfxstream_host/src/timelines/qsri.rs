// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::sync::Mutex;

use log::warn;

pub type QsriCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Timeline {
    present: u64,
    request: u64,
    pending: BTreeMap<u64, QsriCallback>,
}

impl Timeline {
    /// Removes every callback whose request id is below the present count.
    fn take_ready(&mut self) -> Vec<QsriCallback> {
        let later = self.pending.split_off(&self.present);
        std::mem::replace(&mut self.pending, later)
            .into_values()
            .collect()
    }
}

/// Present timeline of one swapchain image.  A callback registered as the R-th request fires on
/// the first present that brings the count to R + 1 or more.
#[derive(Default)]
pub struct VkQsriTimeline {
    timeline: Mutex<Timeline>,
}

impl VkQsriTimeline {
    pub fn new() -> VkQsriTimeline {
        Default::default()
    }

    pub fn signal_next_present_and_poll(&self) {
        let ready = {
            let mut timeline = self.timeline.lock().unwrap();
            timeline.present += 1;
            timeline.take_ready()
        };
        ready.into_iter().for_each(|cb| cb());
    }

    pub fn register_callback_to_next_present_and_poll(&self, callback: QsriCallback) {
        let ready = {
            let mut timeline = self.timeline.lock().unwrap();
            let request = timeline.request;
            timeline.request += 1;
            timeline.pending.insert(request, callback);
            timeline.take_ready()
        };
        ready.into_iter().for_each(|cb| cb());
    }

    pub fn pending(&self) -> usize {
        self.timeline.lock().unwrap().pending.len()
    }
}

impl Drop for VkQsriTimeline {
    fn drop(&mut self) {
        let timeline = match self.timeline.get_mut() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        let remaining = std::mem::take(&mut timeline.pending);
        if !remaining.is_empty() {
            warn!(
                "QSRI timeline destroyed with {} pending callbacks, firing them now",
                remaining.len()
            );
            remaining.into_values().for_each(|cb| cb());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<char>>>, impl Fn(char) -> QsriCallback) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let clone = fired.clone();
        let make = move |name: char| -> QsriCallback {
            let fired = clone.clone();
            Box::new(move || fired.lock().unwrap().push(name))
        };
        (fired, make)
    }

    #[test]
    fn callbacks_fire_on_the_following_present() {
        let (fired, make) = recorder();
        let timeline = VkQsriTimeline::new();

        timeline.register_callback_to_next_present_and_poll(make('A'));
        timeline.register_callback_to_next_present_and_poll(make('B'));
        assert!(fired.lock().unwrap().is_empty());

        timeline.signal_next_present_and_poll();
        assert_eq!(*fired.lock().unwrap(), vec!['A']);

        timeline.signal_next_present_and_poll();
        assert_eq!(*fired.lock().unwrap(), vec!['A', 'B']);
        assert_eq!(timeline.pending(), 0);
    }

    #[test]
    fn registration_after_presents_fires_immediately() {
        let (fired, make) = recorder();
        let timeline = VkQsriTimeline::new();
        timeline.signal_next_present_and_poll();
        timeline.signal_next_present_and_poll();

        // Requests 0 and 1 are already covered by two presents.
        timeline.register_callback_to_next_present_and_poll(make('A'));
        timeline.register_callback_to_next_present_and_poll(make('B'));
        timeline.register_callback_to_next_present_and_poll(make('C'));
        assert_eq!(*fired.lock().unwrap(), vec!['A', 'B']);
        assert_eq!(timeline.pending(), 1);
    }

    #[test]
    fn drop_fires_remaining() {
        let (fired, make) = recorder();
        let timeline = VkQsriTimeline::new();
        timeline.register_callback_to_next_present_and_poll(make('C'));
        drop(timeline);
        assert_eq!(*fired.lock().unwrap(), vec!['C']);
    }
}
