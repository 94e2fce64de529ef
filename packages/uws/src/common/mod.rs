// Shared helpers used across the kernel and the HTTP binding.

pub mod units;
