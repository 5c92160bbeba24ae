//! The wire model shared by all channels: who talks ([identity::Identity]), and what goes over
//!  the socket ([envelope::Envelope]).

pub mod envelope;
pub mod identity;
