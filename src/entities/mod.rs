pub mod customer;
pub mod order;
pub mod order_line;
pub mod order_number_sequence;
