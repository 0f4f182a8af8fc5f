/// Declare an enum over message structs keyed by [`Action`](super::Action).
///
/// Each variant name must match an `Action` variant. The macro generates
/// `action()`, `encode()`, `decode()`, a [`WireMessage`](super::WireMessage)
/// impl and a `From` impl per message.
macro_rules! tagged_union {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident($message:ty)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        $vis enum $name {
            $($variant($message)),+
        }

        impl $name {
            pub fn action(&self) -> $crate::protocol::Action {
                match self {
                    $(Self::$variant(_) => $crate::protocol::Action::$variant),+
                }
            }

            pub fn encode(&self) -> Result<bytes::Bytes, $crate::protocol::ProtocolError> {
                let body = match self {
                    $(Self::$variant(message) => bincode::serialize(message)),+
                }
                .map_err(|e| $crate::protocol::ProtocolError::Encode(e.to_string()))?;
                $crate::protocol::Frame::new(self.action(), body).encode()
            }

            pub fn decode(bytes: &[u8]) -> Result<Self, $crate::protocol::ProtocolError> {
                let frame = $crate::protocol::Frame::decode(bytes)?;
                match frame.action()? {
                    $($crate::protocol::Action::$variant => Ok(Self::$variant(frame.body_as()?)),)+
                    #[allow(unreachable_patterns)]
                    _ => Err($crate::protocol::ProtocolError::InvalidAction(frame.action)),
                }
            }
        }

        impl $crate::protocol::WireMessage for $name {
            fn encode(&self) -> Result<bytes::Bytes, $crate::protocol::ProtocolError> {
                Self::encode(self)
            }

            fn decode(bytes: &[u8]) -> Result<Self, $crate::protocol::ProtocolError> {
                Self::decode(bytes)
            }
        }

        $(
            impl From<$message> for $name {
                fn from(message: $message) -> Self {
                    Self::$variant(message)
                }
            }
        )+
    };
}
