// meshboot starts a fixed set of nodes inside one process and wires every pair
// of them together over TCP, forming a full mesh. Nothing runs on top of the
// mesh yet: once bootstrap returns, each node holds one link per peer and the
// streams are idle.

// Each node owns its listener and an acceptor task that runs for as long as
// the node is alive. The bootstrapper binds every node before any of them
// dials out, so inbound handshakes never race a missing listener. Dialing is
// done in a fixed order (higher id to lower id) so the shape of the mesh is
// deterministic from one run to the next.

pub mod mesh;
