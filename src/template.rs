use std::sync::Arc;

/// Abstract type of an Information Element as carried through the graph
/// and the exporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IeType {
    Boolean,
    Signed64,
    Unsigned64,
    Float64,
    OctetArray,
    Ipv4Address,
    Ipv6Address,
    DateTimeNanoseconds,
}

impl IeType {
    /// Default wire length in octets; 0xFFFF marks variable length.
    pub fn default_length(self) -> u16 {
        match self {
            IeType::Boolean => 1,
            IeType::Signed64 | IeType::Unsigned64 | IeType::Float64 => 8,
            IeType::OctetArray => 0xFFFF,
            IeType::Ipv4Address => 4,
            IeType::Ipv6Address => 16,
            IeType::DateTimeNanoseconds => 8,
        }
    }
}

/// A named, typed column of the record. `id == 0 && pen == 0` marks a
/// temporary element the exporter has to allocate a private id for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformationElement {
    pub name: String,
    pub id: u16,
    pub pen: u32,
    pub ty: IeType,
    pub length: u16,
}

impl InformationElement {
    /// Temporary IE: known name and type, no registered number.
    pub fn temporary(name: &str, ty: IeType) -> Self {
        InformationElement {
            name: name.to_string(),
            id: 0,
            pen: 0,
            ty,
            length: ty.default_length(),
        }
    }
}

/// IANA-assigned elements known to this exporter. Names and numbers from
/// the IANA IPFIX registry; lengths are the natural encodings used here.
const IANA_ELEMENTS: &[(&str, u16, IeType, u16)] = &[
    ("protocolIdentifier", 4, IeType::Unsigned64, 1),
    ("tcpControlBits", 6, IeType::Unsigned64, 2),
    ("sourceTransportPort", 7, IeType::Unsigned64, 2),
    ("sourceIPv4Address", 8, IeType::Ipv4Address, 4),
    ("destinationTransportPort", 11, IeType::Unsigned64, 2),
    ("destinationIPv4Address", 12, IeType::Ipv4Address, 4),
    ("sourceIPv6Address", 27, IeType::Ipv6Address, 16),
    ("destinationIPv6Address", 28, IeType::Ipv6Address, 16),
    ("octetTotalCount", 85, IeType::Unsigned64, 8),
    ("packetTotalCount", 86, IeType::Unsigned64, 8),
    ("flowEndReason", 136, IeType::Unsigned64, 1),
    ("flowStartNanoseconds", 156, IeType::DateTimeNanoseconds, 8),
    ("flowEndNanoseconds", 157, IeType::DateTimeNanoseconds, 8),
];

/// Looks an element up in the IANA subset; `None` for names that will be
/// exported as temporary elements.
pub fn iana_element(name: &str) -> Option<InformationElement> {
    IANA_ELEMENTS
        .iter()
        .find(|(n, _, _, _)| *n == name)
        .map(|&(n, id, ty, length)| InformationElement {
            name: n.to_string(),
            id,
            pen: 0,
            ty,
            length,
        })
}

/// Ordered list of Information Elements describing one record shape.
///
/// All flows compiled from the same specification share one `Template`
/// through an `Arc`; exporters key their wire template ids off `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: usize,
    pub elements: Vec<InformationElement>,
}

impl Template {
    pub fn new(id: usize, elements: Vec<InformationElement>) -> Arc<Self> {
        Arc::new(Template { id, elements })
    }

    pub fn names(&self) -> Vec<String> {
        self.elements.iter().map(|ie| ie.name.clone()).collect()
    }
}
