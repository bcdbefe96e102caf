//! Event descriptors: typed, cheaply-comparable tags identifying a logical
//! message on the bus.

use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Which side of a transport boundary an event crossed, set by adapters so
/// they can avoid re-emitting a message they just received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowDirection {
    /// Received from a transport; adapters must not re-publish this.
    Inbound,
    /// Produced locally and destined for a transport's wildcard publisher.
    Outbound,
}

/// The role an invoke-family-derived descriptor plays, used as a
/// discriminator by predicate listeners ("everything invoke-shaped").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeRole {
    /// `<tag>-send`
    Send,
    /// `<tag>-send-error`
    SendError,
    /// `<tag>-send-stream-end`
    SendStreamEnd,
    /// `<tag>-send-abort`
    SendAbort,
    /// `<tag>-receive`
    Receive,
    /// `<tag>-receive-error`
    ReceiveError,
    /// `<tag>-receive-stream-end`
    ReceiveStreamEnd,
}

/// A typed, stable tag identifying a logical message on the bus.
///
/// Two descriptors are equal iff their `id` matches — `T` is purely a
/// compile-time annotation of the envelope body shape; at runtime a
/// descriptor is just its id plus the two optional marker fields below.
/// `PhantomData<fn() -> T>` (rather than `PhantomData<T>`) keeps
/// `EventDescriptor<T>` `Clone`/`Send`/`Sync` regardless of whether `T`
/// itself is, since the descriptor never actually stores a `T`.
pub struct EventDescriptor<T> {
    id: String,
    flow_direction: Option<FlowDirection>,
    invoke_role: Option<InvokeRole>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> EventDescriptor<T> {
    /// Define a new descriptor with a user-chosen or generated tag.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            flow_direction: None,
            invoke_role: None,
            _marker: PhantomData,
        }
    }

    /// Define a descriptor with a freshly generated tag.
    pub fn generated() -> Self {
        Self::new(crate::id::generate_invoke_id())
    }

    /// Attach a flow-direction marker, consuming and returning `self`.
    pub fn with_flow_direction(mut self, direction: FlowDirection) -> Self {
        self.flow_direction = Some(direction);
        self
    }

    /// Attach an invoke-role marker, consuming and returning `self`.
    pub fn with_invoke_role(mut self, role: InvokeRole) -> Self {
        self.invoke_role = Some(role);
        self
    }

    /// The descriptor's stable string tag.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The flow-direction marker, if any.
    pub fn flow_direction(&self) -> Option<FlowDirection> {
        self.flow_direction
    }

    /// The invoke-role marker, if any.
    pub fn invoke_role(&self) -> Option<InvokeRole> {
        self.invoke_role
    }

    /// Re-tag this descriptor's payload type without touching its id or
    /// markers. Used when a handler needs to view the same wire event
    /// under a different static payload type.
    pub fn retype<U>(&self) -> EventDescriptor<U> {
        EventDescriptor {
            id: self.id.clone(),
            flow_direction: self.flow_direction,
            invoke_role: self.invoke_role,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for EventDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            flow_direction: self.flow_direction,
            invoke_role: self.invoke_role,
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for EventDescriptor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for EventDescriptor<T> {}

impl<T> Hash for EventDescriptor<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> std::fmt::Debug for EventDescriptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDescriptor")
            .field("id", &self.id)
            .field("flow_direction", &self.flow_direction)
            .field("invoke_role", &self.invoke_role)
            .finish()
    }
}

/// Define a plain event descriptor, generating a tag if none is given.
///
/// Mirrors the external interface's `defineEvent(tag?)`.
pub fn define_event<T>(tag: Option<&str>) -> EventDescriptor<T> {
    match tag {
        Some(tag) => EventDescriptor::new(tag),
        None => EventDescriptor::generated(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_compare_by_id_only() {
        let a = EventDescriptor::<()>::new("ping").with_flow_direction(FlowDirection::Inbound);
        let b = EventDescriptor::<()>::new("ping").with_flow_direction(FlowDirection::Outbound);
        assert_eq!(a, b);
    }

    #[test]
    fn generated_descriptors_are_distinct() {
        let a = EventDescriptor::<()>::generated();
        let b = EventDescriptor::<()>::generated();
        assert_ne!(a, b);
    }

    #[test]
    fn retype_preserves_id_and_markers() {
        let a = EventDescriptor::<u32>::new("x").with_invoke_role(InvokeRole::Send);
        let b: EventDescriptor<String> = a.retype();
        assert_eq!(a.id(), b.id());
        assert_eq!(b.invoke_role(), Some(InvokeRole::Send));
    }
}
