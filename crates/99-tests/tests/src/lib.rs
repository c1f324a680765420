//! Cross-crate scenarios: the bus, buffer ownership, the wire codec and the
//! task broker working together.

#[cfg(test)]
mod array_multiply;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod http_bridge;
