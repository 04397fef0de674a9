pub mod packet;
pub mod tcp_packet;
