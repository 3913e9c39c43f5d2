use aero_wire_protocol::{ObjectHandle, ObjectType};

/// A typed client-side object handle.
pub trait WireObject: Copy {
    const TYPE: ObjectType;

    fn handle(self) -> ObjectHandle;
    fn from_handle(handle: ObjectHandle) -> Self;
}

macro_rules! wire_objects {
    ($( $(#[$meta:meta])* $name:ident => $ty:ident, )*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(ObjectHandle);

            impl WireObject for $name {
                const TYPE: ObjectType = ObjectType::$ty;

                fn handle(self) -> ObjectHandle {
                    self.0
                }

                fn from_handle(handle: ObjectHandle) -> Self {
                    Self(handle)
                }
            }
        )*
    };
}

wire_objects! {
    /// Root of an object tree. Releasing the last reference destroys every
    /// object created from it.
    Device => Device,
    Queue => Queue,
    Buffer => Buffer,
    ShaderModule => ShaderModule,
    CommandEncoder => CommandEncoder,
    CommandBuffer => CommandBuffer,
    Fence => Fence,
}

/// Order in which a device's children are torn down.
pub(crate) const CASCADE_ORDER: [ObjectType; 6] = [
    ObjectType::CommandBuffer,
    ObjectType::CommandEncoder,
    ObjectType::Fence,
    ObjectType::ShaderModule,
    ObjectType::Buffer,
    ObjectType::Queue,
];
