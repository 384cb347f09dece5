//! Recurrent state management for gated linear recurrence models.
//!
//! These models replace the KV cache with a fixed-size state per layer:
//!
//! - **Recurrent state**: the carried hidden state `h` (shape: [batch, input_dim])
//! - **Conv state**: trailing input windows for the short convolutions
//!   (shape: [batch, input_dim, conv_size-1] per projection)
//!
//! A [`RecurrentCache`] starts empty and fills lazily as layers run, so
//! its memory footprint follows the layers that actually carry state.

use std::collections::HashMap;

use tracing::debug;

use candle_core::Tensor;
use thiserror::Error;

/// State carried by one layer between forward calls.
#[derive(Debug, Clone)]
pub struct LayerState {
    /// Hidden recurrence state, shape [batch, input_dim].
    pub recurrent_state: Tensor,
    /// Trailing input windows for the input and forget convolutions,
    /// each of shape [batch, input_dim, conv_size-1]. Absent when the
    /// layer runs without short convolutions.
    pub conv_state: Option<(Tensor, Tensor)>,
}

/// Per-request cache of layer states plus the decoding position.
///
/// Layer slots are `None` until the layer first writes its state, so a
/// fresh cache signals "start from zero" to every layer.
#[derive(Debug, Clone, Default)]
pub struct RecurrentCache {
    layers: Vec<Option<LayerState>>,
    seen_tokens: usize,
}

impl RecurrentCache {
    /// Create an empty cache with a slot per layer.
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| None).collect(),
            seen_tokens: 0,
        }
    }

    /// State stored for a layer, if it has written one.
    pub fn layer(&self, layer_idx: usize) -> Option<&LayerState> {
        self.layers.get(layer_idx).and_then(|slot| slot.as_ref())
    }

    /// Store a layer's state after its forward pass.
    ///
    /// `offset` is the number of time steps the layer consumed; the
    /// cache position advances once per model pass, on layer 0.
    pub fn update(
        &mut self,
        layer_idx: usize,
        recurrent_state: Tensor,
        conv_state: Option<(Tensor, Tensor)>,
        offset: usize,
    ) {
        if self.layers.len() <= layer_idx {
            self.layers.resize_with(layer_idx + 1, || None);
        }
        self.layers[layer_idx] = Some(LayerState {
            recurrent_state,
            conv_state,
        });
        if layer_idx == 0 {
            self.seen_tokens += offset;
        }
    }

    /// Number of time steps this cache has absorbed.
    pub fn seen_tokens(&self) -> usize {
        self.seen_tokens
    }

    /// Number of layer slots.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Drop all layer states and rewind the position to zero.
    pub fn reset(&mut self) {
        for slot in &mut self.layers {
            *slot = None;
        }
        self.seen_tokens = 0;
    }
}

#[derive(Debug, Error)]
pub enum RecurrentStateError {
    #[error("request {0} not found in state manager")]
    RequestNotFound(u64),
    #[error("request {0} already has allocated state")]
    RequestAlreadyExists(u64),
}

/// Manages recurrent caches across concurrent requests.
///
/// Each active request gets its own [`RecurrentCache`]. Caches are
/// allocated when a request begins and freed when it completes.
pub struct RecurrentStateManager {
    num_layers: usize,
    caches: HashMap<u64, RecurrentCache>,
}

impl RecurrentStateManager {
    /// Create a manager for a model with `num_layers` recurrent layers.
    pub fn new(num_layers: usize) -> Self {
        Self {
            num_layers,
            caches: HashMap::new(),
        }
    }

    /// Allocate an empty cache for a new request.
    pub fn allocate_state(
        &mut self,
        request_id: u64,
    ) -> Result<&mut RecurrentCache, RecurrentStateError> {
        if self.caches.contains_key(&request_id) {
            return Err(RecurrentStateError::RequestAlreadyExists(request_id));
        }
        self.caches
            .insert(request_id, RecurrentCache::new(self.num_layers));
        debug!(request_id, "Allocated recurrent state");

        // Safe: we just inserted the key above
        Ok(self.caches.get_mut(&request_id).expect("just inserted"))
    }

    /// Get mutable access to the cache for an existing request.
    pub fn get_state(&mut self, request_id: u64) -> Option<&mut RecurrentCache> {
        self.caches.get_mut(&request_id)
    }

    /// Free the cache for a completed request.
    pub fn free_state(&mut self, request_id: u64) {
        if self.caches.remove(&request_id).is_some() {
            debug!(request_id, "Freed recurrent state");
        }
    }

    /// Clear a request's cache back to its freshly-allocated form.
    pub fn reset_state(&mut self, request_id: u64) -> Result<(), RecurrentStateError> {
        let cache = self
            .caches
            .get_mut(&request_id)
            .ok_or(RecurrentStateError::RequestNotFound(request_id))?;
        cache.reset();
        Ok(())
    }

    /// Number of active requests with allocated state.
    pub fn num_active_requests(&self) -> usize {
        self.caches.len()
    }

    /// Check if a request has allocated state.
    pub fn has_state(&self, request_id: u64) -> bool {
        self.caches.contains_key(&request_id)
    }
}
