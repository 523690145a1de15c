// Order lifecycle
pub mod orders;

// Status progression table
pub mod order_status;

// Monthly order-number allocation
pub mod order_numbers;

pub mod clock;
