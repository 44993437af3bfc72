pub mod datagram_socket;
pub mod udp_endpoint;

pub use datagram_socket::DatagramSocket;
pub use udp_endpoint::UdpEndpoint;
