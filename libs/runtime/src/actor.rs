//! Actor interface
//!
//! The runtime only needs to know whether an actor can fire and to give it
//! access to its own ports during one firing step. What an actor computes
//! is its own business.

use crate::error::{Result, RuntimeError};
use crate::port::PortTable;
use flow_types::{ActorId, PortId, Token};
use std::collections::HashMap;

pub trait Actor: Send {
    fn id(&self) -> &ActorId;

    /// Disabled actors are skipped by the scheduler
    fn enabled(&self) -> bool {
        true
    }

    /// Run one firing step; true when it consumed or produced anything
    fn fire(&mut self, io: &mut ActorIo<'_>) -> bool;
}

/// An actor's view of its ports for one firing step
pub struct ActorIo<'a> {
    actor_id: &'a ActorId,
    ports: &'a mut PortTable,
    names: &'a HashMap<String, PortId>,
}

impl<'a> ActorIo<'a> {
    pub fn new(actor_id: &'a ActorId, ports: &'a mut PortTable, names: &'a HashMap<String, PortId>) -> Self {
        Self { actor_id, ports, names }
    }

    pub fn actor_id(&self) -> &ActorId {
        self.actor_id
    }

    fn port_id(&self, name: &str) -> Result<&PortId> {
        self.names
            .get(name)
            .ok_or_else(|| RuntimeError::unknown_port(&PortId::from(name)))
    }

    fn port_mut(&mut self, name: &str) -> Result<&mut crate::port::Port> {
        let id = self.port_id(name)?.clone();
        self.ports.get_mut(&id).ok_or_else(|| RuntimeError::unknown_port(&id))
    }

    pub fn tokens_available(&self, port: &str, n: usize) -> bool {
        self.port_id(port)
            .ok()
            .and_then(|id| self.ports.get(id))
            .map(|p| p.tokens_available(n))
            .unwrap_or(false)
    }

    pub fn slots_available(&self, port: &str, n: usize) -> bool {
        self.port_id(port)
            .ok()
            .and_then(|id| self.ports.get(id))
            .map(|p| p.slots_available(n))
            .unwrap_or(false)
    }

    /// Tentative read; undone by [`Self::cancel`]
    pub fn peek(&mut self, port: &str) -> Result<Token> {
        Ok(self.port_mut(port)?.peek_token()?)
    }

    pub fn commit(&mut self, port: &str) -> Result<()> {
        self.port_mut(port)?.commit()?;
        Ok(())
    }

    pub fn cancel(&mut self, port: &str) -> Result<()> {
        Ok(self.port_mut(port)?.cancel()?)
    }

    /// Peek and commit in one step
    pub fn read(&mut self, port: &str) -> Result<Token> {
        let port = self.port_mut(port)?;
        let token = port.peek_token()?;
        port.commit()?;
        Ok(token)
    }

    pub fn write(&mut self, port: &str, token: Token) -> Result<()> {
        Ok(self.port_mut(port)?.write_token(token)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::port::Port;
    use crate::queue::TokenQueue;
    use flow_types::PortProperties;
    use serde_json::json;

    #[test]
    fn test_io_resolves_names() {
        let actor = ActorId::from("relay");
        let mut ports = PortTable::new();
        let mut out = Port::with_id(PortId::from("p-out"), "out", actor.clone(), PortProperties::outport(), 2);
        out.queue_mut().add_reader(&PortId::from("peer"), &PortProperties::inport());
        ports.insert(out.id().clone(), out);
        let names = HashMap::from([("out".to_string(), PortId::from("p-out"))]);

        let mut io = ActorIo::new(&actor, &mut ports, &names);
        assert!(io.slots_available("out", 2));
        io.write("out", Token::new(json!(1))).unwrap();
        io.write("out", Token::new(json!(2))).unwrap();
        assert!(matches!(
            io.write("out", Token::new(json!(3))),
            Err(RuntimeError::Queue(QueueError::Full))
        ));
        assert!(matches!(io.peek("missing"), Err(RuntimeError::UnknownPort { .. })));
    }
}
