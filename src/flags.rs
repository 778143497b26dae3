//! Distribution capability flags.

bitflags::bitflags! {
    /// Distribution flags.
    ///
    /// Both nodes advertise their flags during the handshake; the features
    /// used on an established connection are the intersection of the two
    /// sets.
    pub struct DistributionFlags: u64 {
        /// The node is to be published and part of the global namespace.
        const PUBLISHED = 0x01;

        /// The node implements an atom cache (obsolete).
        const ATOM_CACHE = 0x02;

        /// The node implements extended (3 × 32 bits) references.
        ///
        /// [NOTE] This flag is mandatory. If not present, the connection is refused.
        const EXTENDED_REFERENCES = 0x04;

        /// The node implements distributed process monitoring.
        const DIST_MONITOR = 0x08;

        /// The node uses separate tag for funs (lambdas) in the distribution protocol.
        const FUN_TAGS = 0x10;

        /// The node implements distributed named process monitoring.
        const DIST_MONITOR_NAME = 0x20;

        /// The (hidden) node implements atom cache (obsolete).
        const HIDDEN_ATOM_CACHE = 0x40;

        /// The node understands new fun tags.
        const NEW_FUN_TAGS = 0x80;

        /// The node can handle extended pids and ports.
        ///
        /// [NOTE] This flag is mandatory. If not present, the connection is refused.
        const EXTENDED_PIDS_PORTS = 0x100;

        /// This node understands `EXPORT_EXT` tag.
        const EXPORT_PTR_TAG = 0x200;

        /// The node understands bit binaries.
        const BIT_BINARIES = 0x400;

        /// The node understands the new float format.
        const NEW_FLOATS = 0x800;

        /// This node allows unicode characters in I/O operations.
        const UNICODE_IO = 0x1000;

        /// The node implements atom cache in distribution header.
        ///
        /// Note that this crate does not handle distribution headers.
        const DIST_HDR_ATOM_CACHE = 0x2000;

        /// The node understands the `SMALL_ATOM_EXT` tag.
        const SMALL_ATOM_TAGS = 0x4000;

        /// The node understands UTF-8 encoded atoms.
        const UTF8_ATOMS = 0x10000;

        /// The node understands maps.
        const MAP_TAG = 0x20000;

        /// The node understands big node creation tags `NEW_PID_EXT`, `NEW_PORT_EXT` and `NEWER_REFERENCE_EXT`.
        const BIG_CREATION = 0x40000;

        /// Use the `SEND_SENDER` control message instead of the `SEND` control message.
        const SEND_SENDER = 0x80000;

        /// The node understands any term as the seqtrace label.
        const BIG_SEQTRACE_LABELS = 0x100000;

        /// Use the `PAYLOAD_*` control message variants.
        const EXIT_PAYLOAD = 0x400000;

        /// Use fragmented distribution messages to send large messages.
        const FRAGMENTS = 0x800000;

        /// The node supports the new connection setup handshake (version 6) introduced in OTP 23.
        const HANDSHAKE_23 = 0x1000000;

        /// Use the new link protocol.
        const UNLINK_ID = 0x2000000;

        /// The node supports spawn requests over the distribution.
        const SPAWN = 1 << 32;

        /// Dynamic node name.
        ///
        /// This is not a capability but rather used as a request from the connecting node
        /// to receive its node name from the accepting node as part of the handshake.
        const NAME_ME = 1 << 33;

        /// The node accepts a larger amount of data in pids, ports and references.
        const V4_NC = 1 << 34;

        /// The node supports process aliases.
        const ALIAS = 1 << 35;
    }
}

impl Default for DistributionFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl DistributionFlags {
    /// Makes a new [`DistributionFlags`] with the default flag set.
    ///
    /// The default set is everything this crate can actually honor on the
    /// wire: extended identifiers, both fun tag families, UTF-8 atoms, maps,
    /// export funs, bit binaries, the new float format, big creations and the
    /// OTP 23 handshake.
    pub fn new() -> Self {
        Self::EXTENDED_REFERENCES
            | Self::EXTENDED_PIDS_PORTS
            | Self::BIT_BINARIES
            | Self::NEW_FLOATS
            | Self::FUN_TAGS
            | Self::NEW_FUN_TAGS
            | Self::UTF8_ATOMS
            | Self::MAP_TAG
            | Self::EXPORT_PTR_TAG
            | Self::BIG_CREATION
            | Self::HANDSHAKE_23
    }

    /// Gets the flags a peer must advertise for a connection to be accepted.
    pub fn mandatory() -> Self {
        Self::EXTENDED_REFERENCES | Self::EXTENDED_PIDS_PORTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_include_the_mandatory_set() {
        assert!(DistributionFlags::new().contains(DistributionFlags::mandatory()));
        assert!(DistributionFlags::new().contains(DistributionFlags::HANDSHAKE_23));
    }

    #[test]
    fn flags_split_into_low_and_high_words() {
        let flags = DistributionFlags::new() | DistributionFlags::SPAWN;
        let low = flags.bits() as u32;
        let high = (flags.bits() >> 32) as u32;
        assert_eq!(u64::from(low) | (u64::from(high) << 32), flags.bits());
    }
}
