//! The rule compiler: pattern plus actions in, per-class hardware
//! match descriptors out.
//!
//! Compilation runs in four steps. Attributes, actions and items are
//! validated first, which also sizes the descriptor of every hash
//! class. Buffers are then allocated for the classes the RSS request
//! can land on. The item converters fill the buffers, and a final
//! pruning pass discards classes the pattern's own layer makes
//! unreachable and completes the survivors with wildcard fillers.

use rxsteer_hal::{CounterId, FlowHal};

use crate::action::{Action, RssAction};
use crate::hash_class::{HashClass, HASH_CLASSES};
use crate::item::{
    self, EthItem, Ipv4Item, Ipv6Item, ItemKind, ItemSpec, MatchItem, Pattern, TcpItem, UdpItem,
    VlanItem, VxlanItem,
};
use crate::spec::{self, frag, Descriptor, SpecFragment, FRAG_HDR_LEN, SPEC_INNER};
use crate::types::{
    FlowAttr, FlowError, FlowResult, IpVersion, RssConfig, CTRL_FLOW_PRIORITY, MARK_ID_DEFAULT,
    MARK_ID_MAX, MAX_FLOW_QUEUES, RSS_KEY_LEN,
};

/// Device-side inputs to one compile call.
pub(crate) struct ConvertCtx<'a> {
    pub rxqs_n: u16,
    pub default_rss: &'a RssConfig,
}

/// Per-class descriptor slot. Before allocation it only accumulates the
/// byte size the class would need; after allocation pushes go into the
/// actual buffer.
#[derive(Debug, Default)]
pub(crate) struct ClassBuf {
    required: usize,
    pub(crate) buf: Option<Descriptor>,
}

impl ClassBuf {
    fn reserve(&mut self, len: usize) {
        self.required += len;
    }

    fn allocate(&mut self) {
        self.buf = Some(Descriptor::new(self.required));
    }

    /// Append a fragment if the class has a buffer, otherwise account
    /// for its size.
    fn push(&mut self, fragment: &[u8]) {
        match &mut self.buf {
            Some(desc) => desc.append(fragment),
            None => self.required += fragment.len(),
        }
    }

    fn clear(&mut self) {
        self.buf = None;
    }

    pub(crate) fn take(&mut self) -> Option<Descriptor> {
        self.buf.take()
    }
}

/// Working state of one compile call. Fields that outlive the call are
/// copied into the flow record by the caller.
#[derive(Debug)]
pub(crate) struct FlowParser {
    pub(crate) create: bool,
    inner: u16,
    pub(crate) drop: bool,
    pub(crate) mark: bool,
    pub(crate) count: bool,
    pub(crate) mark_id: u32,
    pub(crate) queues: Vec<u16>,
    pub(crate) rss: RssConfig,
    pub(crate) layer: HashClass,
    pub(crate) counter: Option<CounterId>,
    pub(crate) classes: [ClassBuf; 7],
}

/// Compile `pattern` and `actions` into per-class descriptors.
///
/// With `create` false this is a dry run: everything is checked and
/// sized but no hardware object is touched, and the result can simply
/// be dropped.
pub(crate) fn convert<H: FlowHal>(
    hal: &H,
    ctx: &ConvertCtx<'_>,
    attr: &FlowAttr,
    pattern: &[MatchItem],
    actions: &[Action],
    create: bool,
) -> FlowResult<FlowParser> {
    let mut parser = FlowParser {
        create,
        inner: 0,
        drop: false,
        mark: false,
        count: false,
        mark_id: MARK_ID_DEFAULT,
        queues: Vec::new(),
        rss: ctx.default_rss.clone(),
        layer: HashClass::Eth,
        counter: None,
        classes: Default::default(),
    };
    convert_attributes(attr)?;
    parser.convert_actions(ctx, actions)?;
    parser.validate_items(pattern)?;
    // Sizing pass: the layer is still the catch-all here, so every
    // class accounts for the fillers it could possibly need.
    parser.finalise();
    if parser.drop {
        parser.classes[HashClass::Eth.index()].allocate();
    } else {
        for class in HASH_CLASSES {
            if !parser.rss.types.intersects(class.rss_types()) && class != HashClass::Eth {
                continue;
            }
            parser.classes[class.index()].allocate();
        }
    }
    parser.inner = 0;
    for it in pattern {
        parser.convert_item(it)?;
    }
    if parser.mark {
        parser.push_mark();
    }
    if parser.count && parser.create {
        let counter = hal.create_counter().map_err(|e| {
            FlowError::ResourceExhausted(format!("cannot create counter: {e}"))
        })?;
        parser.counter = Some(counter);
        parser.push_count(counter);
    }
    if !parser.drop {
        parser.finalise();
    }
    parser.update_priority(attr);
    Ok(parser)
}

fn convert_attributes(attr: &FlowAttr) -> FlowResult<()> {
    if attr.group != 0 {
        return Err(FlowError::Unsupported("groups are not supported".into()));
    }
    if attr.priority != 0 && attr.priority != CTRL_FLOW_PRIORITY {
        return Err(FlowError::Unsupported(
            "priorities are not supported".into(),
        ));
    }
    if attr.egress {
        return Err(FlowError::Unsupported("egress is not supported".into()));
    }
    if !attr.ingress {
        return Err(FlowError::Unsupported("only ingress is supported".into()));
    }
    Ok(())
}

impl FlowParser {
    fn convert_actions(&mut self, ctx: &ConvertCtx<'_>, actions: &[Action]) -> FlowResult<()> {
        for action in actions {
            match action {
                Action::Drop => self.drop = true,
                Action::Queue { index } => {
                    if *index >= ctx.rxqs_n {
                        return Err(FlowError::InvalidArgument(format!(
                            "queue index {index} out of range"
                        )));
                    }
                    let found = self.queues.contains(index);
                    if self.queues.len() > 1 && !found {
                        return Err(FlowError::Unsupported(
                            "queue action not in RSS queues".into(),
                        ));
                    }
                    if !found {
                        self.queues = vec![*index];
                    }
                }
                Action::Rss(rss) => self.convert_rss(ctx, rss)?,
                Action::Mark { id } => {
                    if *id >= MARK_ID_MAX {
                        return Err(FlowError::InvalidArgument(format!(
                            "mark id must be below {MARK_ID_MAX}"
                        )));
                    }
                    self.mark = true;
                    self.mark_id = *id;
                }
                Action::Flag => self.mark = true,
                Action::Count => self.count = true,
            }
        }
        // Drop swallows the packet, marking it is pointless.
        if self.drop && self.mark {
            self.mark = false;
        }
        if self.queues.is_empty() && !self.drop {
            return Err(FlowError::Unsupported("no valid action".into()));
        }
        Ok(())
    }

    fn convert_rss(&mut self, ctx: &ConvertCtx<'_>, rss: &RssAction) -> FlowResult<()> {
        if rss.queues.is_empty() {
            return Err(FlowError::InvalidArgument("no valid queues".into()));
        }
        if self.queues.len() == 1 && !rss.queues.contains(&self.queues[0]) {
            return Err(FlowError::Unsupported(
                "queue action not in RSS queues".into(),
            ));
        }
        if rss.queues.len() > MAX_FLOW_QUEUES {
            return Err(FlowError::InvalidArgument(
                "too many queues for RSS context".into(),
            ));
        }
        for &q in &rss.queues {
            if q >= ctx.rxqs_n {
                return Err(FlowError::InvalidArgument(format!(
                    "queue index {q} out of range"
                )));
            }
        }
        self.queues = rss.queues.clone();
        if let Some(conf) = &rss.conf {
            if let Some(key) = &conf.key {
                if key.len() != RSS_KEY_LEN {
                    return Err(FlowError::InvalidArgument(format!(
                        "RSS key must be {RSS_KEY_LEN} bytes"
                    )));
                }
                self.rss.key.copy_from_slice(key);
            }
            self.rss.types = conf.types;
        }
        Ok(())
    }

    /// Walk the pattern against the item graph, run the byte-wise mask
    /// checks and account for the descriptor bytes each class needs.
    fn validate_items(&mut self, pattern: &[MatchItem]) -> FlowResult<()> {
        let mut allowed: &[ItemKind] = item::START_ITEMS;
        for it in pattern {
            let kind = it.kind();
            if !allowed.contains(&kind) {
                return Err(FlowError::Unsupported(format!(
                    "{} item not allowed at this position",
                    kind.name()
                )));
            }
            let dst_sz = match it {
                MatchItem::Eth(p) => {
                    p.effective_mask()?;
                    spec::ETH_SPEC_SIZE
                }
                // Merges into the Ethernet fragment, no bytes of its own.
                MatchItem::Vlan(p) => {
                    p.effective_mask()?;
                    0
                }
                MatchItem::Ipv4(p) => {
                    p.effective_mask()?;
                    spec::IPV4_SPEC_SIZE
                }
                MatchItem::Ipv6(p) => {
                    p.effective_mask()?;
                    spec::IPV6_SPEC_SIZE
                }
                MatchItem::Udp(p) => {
                    p.effective_mask()?;
                    spec::TCP_UDP_SPEC_SIZE
                }
                MatchItem::Tcp(p) => {
                    p.effective_mask()?;
                    spec::TCP_UDP_SPEC_SIZE
                }
                MatchItem::Vxlan(p) => {
                    p.effective_mask()?;
                    spec::TUNNEL_SPEC_SIZE
                }
            };
            if kind == ItemKind::Vxlan {
                if self.inner != 0 {
                    return Err(FlowError::Unsupported(
                        "cannot recognize multiple VXLAN encapsulations".into(),
                    ));
                }
                self.inner = SPEC_INNER;
            }
            if self.drop {
                self.classes[HashClass::Eth.index()].reserve(dst_sz);
            } else {
                for class in HASH_CLASSES {
                    self.classes[class.index()].reserve(dst_sz);
                }
            }
            allowed = item::successors(kind);
        }
        if self.drop {
            self.classes[HashClass::Eth.index()].reserve(spec::DROP_SPEC_SIZE);
        }
        if self.mark {
            for class in HASH_CLASSES {
                self.classes[class.index()].reserve(spec::TAG_SPEC_SIZE);
            }
        }
        if self.count {
            for class in HASH_CLASSES {
                self.classes[class.index()].reserve(spec::COUNT_SPEC_SIZE);
            }
        }
        Ok(())
    }

    /// Prune classes the compiled flow cannot land on and complete the
    /// survivors with wildcard fillers for the layers the pattern left
    /// out. Before allocation the same walk only accumulates sizes.
    fn finalise(&mut self) {
        // Single queue without RSS delivers through the catch-all
        // class alone.
        if self.queues.len() == 1 && self.rss.types.is_empty() {
            for class in HASH_CLASSES {
                if class != HashClass::Eth {
                    self.classes[class.index()].clear();
                }
            }
            return;
        }
        if self.layer != HashClass::Eth {
            // The pattern names an L3/L4 layer, so the catch-all and
            // the opposite IP version cannot match it.
            self.classes[HashClass::Eth.index()].clear();
            let version = self.layer.ip_version();
            for class in HASH_CLASSES {
                if class.ip_version().is_some() && class.ip_version() != version {
                    self.classes[class.index()].clear();
                }
            }
            let ip_class = match version {
                Some(IpVersion::V4) => HashClass::Ipv4,
                _ => HashClass::Ipv6,
            };
            if self.layer.rss_types().intersects(self.rss.types) {
                for class in HASH_CLASSES {
                    if class == self.layer || class == HashClass::Eth {
                        continue;
                    }
                    if class.ip_version() == version {
                        self.classes[class.index()].clear();
                    }
                }
            } else if self.classes[ip_class.index()].buf.is_none() {
                // No class can satisfy the RSS request, degenerate to
                // a single-queue flow.
                self.queues.truncate(1);
                return;
            }
        }
        for class in HASH_CLASSES {
            if class == HashClass::Eth || class == self.layer {
                continue;
            }
            if self.layer == HashClass::Eth {
                let (ty, size) = match class.ip_version() {
                    Some(IpVersion::V4) => (frag::IPV4, spec::IPV4_SPEC_SIZE),
                    _ => (frag::IPV6, spec::IPV6_SPEC_SIZE),
                };
                self.classes[class.index()].push(&spec::filler(ty, size));
            }
            let l4 = match class {
                HashClass::UdpV4 | HashClass::UdpV6 => Some(frag::UDP),
                HashClass::TcpV4 | HashClass::TcpV6 => Some(frag::TCP),
                _ => None,
            };
            if let Some(ty) = l4 {
                self.classes[class.index()].push(&spec::filler(ty, spec::TCP_UDP_SPEC_SIZE));
            }
        }
    }

    /// Copy one fragment into every allocated class the current layer
    /// is compatible with: same IP version, or no IP version at all.
    fn copy_fragment(&mut self, fragment: &[u8]) {
        for class in HASH_CLASSES {
            if self.classes[class.index()].buf.is_none() {
                continue;
            }
            if self.layer == HashClass::Eth
                || class.ip_version() == self.layer.ip_version()
                || class.ip_version().is_none()
            {
                self.classes[class.index()].push(fragment);
            }
        }
    }

    fn convert_item(&mut self, it: &MatchItem) -> FlowResult<()> {
        match it {
            MatchItem::Eth(p) => self.convert_eth(p),
            MatchItem::Vlan(p) => self.convert_vlan(p),
            MatchItem::Ipv4(p) => self.convert_ipv4(p),
            MatchItem::Ipv6(p) => self.convert_ipv6(p),
            MatchItem::Udp(p) => self.convert_udp(p),
            MatchItem::Tcp(p) => self.convert_tcp(p),
            MatchItem::Vxlan(p) => self.convert_vxlan(p),
        }
    }

    fn convert_eth(&mut self, p: &Pattern<EthItem>) -> FlowResult<()> {
        // Inner headers never move the classification layer.
        if self.inner == 0 {
            self.layer = HashClass::Eth;
        }
        let mask = p.mask.unwrap_or_else(EthItem::default_mask);
        let mut val = p.spec;
        for i in 0..6 {
            val.dst[i] &= mask.dst[i];
            val.src[i] &= mask.src[i];
        }
        val.ether_type &= mask.ether_type;
        let mut f = SpecFragment::new(self.inner | frag::ETH, spec::ETH_SPEC_SIZE);
        f.write(0, &val.dst);
        f.write(6, &val.src);
        f.write(12, &val.ether_type.to_be_bytes());
        // Bytes 14..16 hold the VLAN tag, merged in later if present.
        f.write(16, &mask.dst);
        f.write(22, &mask.src);
        f.write(28, &mask.ether_type.to_be_bytes());
        self.copy_fragment(&f.finish());
        Ok(())
    }

    /// VLAN matching folds into the Ethernet fragment written just
    /// before it; the hardware treats a zero tag mask as "no VLAN
    /// layer", which would silently widen the match.
    fn convert_vlan(&mut self, p: &Pattern<VlanItem>) -> FlowResult<()> {
        let mask = p.mask.unwrap_or_else(VlanItem::default_mask);
        if mask.tci == 0 {
            return Err(FlowError::InvalidArgument("VLAN cannot be empty".into()));
        }
        let tci = p.spec.tci & mask.tci;
        for idx in 0..self.classes.len() {
            let Some(desc) = &mut self.classes[idx].buf else {
                continue;
            };
            let Some(eth) = desc.last_fragment_mut() else {
                continue;
            };
            eth[FRAG_HDR_LEN + 14..FRAG_HDR_LEN + 16].copy_from_slice(&tci.to_be_bytes());
            eth[FRAG_HDR_LEN + 30..FRAG_HDR_LEN + 32].copy_from_slice(&mask.tci.to_be_bytes());
        }
        Ok(())
    }

    fn convert_ipv4(&mut self, p: &Pattern<Ipv4Item>) -> FlowResult<()> {
        if self.inner == 0 {
            self.layer = HashClass::Ipv4;
        }
        let mask = p.mask.unwrap_or_else(Ipv4Item::default_mask);
        let src = p.spec.src & mask.src;
        let dst = p.spec.dst & mask.dst;
        let proto = p.spec.proto & mask.proto;
        let tos = p.spec.tos & mask.tos;
        let mut f = SpecFragment::new(self.inner | frag::IPV4, spec::IPV4_SPEC_SIZE);
        f.write(0, &src.to_be_bytes());
        f.write(4, &dst.to_be_bytes());
        f.write(8, &[proto, tos]);
        f.write(12, &mask.src.to_be_bytes());
        f.write(16, &mask.dst.to_be_bytes());
        f.write(20, &[mask.proto, mask.tos]);
        self.copy_fragment(&f.finish());
        Ok(())
    }

    fn convert_ipv6(&mut self, p: &Pattern<Ipv6Item>) -> FlowResult<()> {
        const FLOW_LABEL_MASK: u32 = 0x000f_ffff;
        const TRAFFIC_CLASS_MASK: u32 = 0x0ff0_0000;
        const TRAFFIC_CLASS_SHIFT: u32 = 20;

        if self.inner == 0 {
            self.layer = HashClass::Ipv6;
        }
        let mask = p.mask.unwrap_or_else(Ipv6Item::default_mask);
        let mut src = p.spec.src;
        let mut dst = p.spec.dst;
        for i in 0..16 {
            src[i] &= mask.src[i];
            dst[i] &= mask.dst[i];
        }
        let label_mask = mask.vtc_flow & FLOW_LABEL_MASK;
        let label = p.spec.vtc_flow & label_mask;
        let tc_mask = ((mask.vtc_flow & TRAFFIC_CLASS_MASK) >> TRAFFIC_CLASS_SHIFT) as u8;
        let tc = (((p.spec.vtc_flow & TRAFFIC_CLASS_MASK) >> TRAFFIC_CLASS_SHIFT) as u8) & tc_mask;
        let next_hdr = p.spec.proto & mask.proto;
        let hop_limit = p.spec.hop_limits & mask.hop_limits;
        let mut f = SpecFragment::new(self.inner | frag::IPV6, spec::IPV6_SPEC_SIZE);
        f.write(0, &src);
        f.write(16, &dst);
        f.write(32, &label.to_be_bytes());
        f.write(36, &[next_hdr, tc, hop_limit]);
        f.write(40, &mask.src);
        f.write(56, &mask.dst);
        f.write(72, &label_mask.to_be_bytes());
        f.write(76, &[mask.proto, tc_mask, mask.hop_limits]);
        self.copy_fragment(&f.finish());
        Ok(())
    }

    fn convert_udp(&mut self, p: &Pattern<UdpItem>) -> FlowResult<()> {
        if self.inner == 0 {
            self.layer = if self.layer == HashClass::Ipv4 {
                HashClass::UdpV4
            } else {
                HashClass::UdpV6
            };
        }
        let mask = p.mask.unwrap_or_else(UdpItem::default_mask);
        let mut f = SpecFragment::new(self.inner | frag::UDP, spec::TCP_UDP_SPEC_SIZE);
        f.write(0, &(p.spec.src_port & mask.src_port).to_be_bytes());
        f.write(2, &(p.spec.dst_port & mask.dst_port).to_be_bytes());
        f.write(4, &mask.src_port.to_be_bytes());
        f.write(6, &mask.dst_port.to_be_bytes());
        self.copy_fragment(&f.finish());
        Ok(())
    }

    fn convert_tcp(&mut self, p: &Pattern<TcpItem>) -> FlowResult<()> {
        if self.inner == 0 {
            self.layer = if self.layer == HashClass::Ipv4 {
                HashClass::TcpV4
            } else {
                HashClass::TcpV6
            };
        }
        let mask = p.mask.unwrap_or_else(TcpItem::default_mask);
        let mut f = SpecFragment::new(self.inner | frag::TCP, spec::TCP_UDP_SPEC_SIZE);
        f.write(0, &(p.spec.src_port & mask.src_port).to_be_bytes());
        f.write(2, &(p.spec.dst_port & mask.dst_port).to_be_bytes());
        f.write(4, &mask.src_port.to_be_bytes());
        f.write(6, &mask.dst_port.to_be_bytes());
        self.copy_fragment(&f.finish());
        Ok(())
    }

    fn convert_vxlan(&mut self, p: &Pattern<VxlanItem>) -> FlowResult<()> {
        let mask = p.mask.unwrap_or_else(VxlanItem::default_mask);
        // The tunnel fragment itself matches the outer headers; only
        // what follows is inner.
        let outer = self.inner;
        self.inner = SPEC_INNER;
        let mut id = [0u8; 4];
        let mut id_mask = [0u8; 4];
        for i in 0..3 {
            id_mask[i + 1] = mask.vni[i];
            id[i + 1] = p.spec.vni[i] & mask.vni[i];
        }
        // A zero tunnel id degenerates into a wildcard that matches
        // every packet reaching the layers before it.
        if id == [0u8; 4] {
            return Err(FlowError::InvalidArgument("VXLAN vni cannot be 0".into()));
        }
        let mut f = SpecFragment::new(outer | frag::TUNNEL, spec::TUNNEL_SPEC_SIZE);
        f.write(0, &id);
        f.write(4, &id_mask);
        self.copy_fragment(&f.finish());
        Ok(())
    }

    fn push_mark(&mut self) {
        let mut f = SpecFragment::new(frag::TAG, spec::TAG_SPEC_SIZE);
        // Zero is reserved to mean "no mark", ids shift up by one.
        f.write(0, &(self.mark_id + 1).to_le_bytes());
        self.copy_fragment(&f.finish());
    }

    fn push_count(&mut self, counter: CounterId) {
        let mut f = SpecFragment::new(frag::COUNT, spec::COUNT_SPEC_SIZE);
        f.write(0, &counter.as_raw().to_le_bytes());
        self.copy_fragment(&f.finish());
    }

    /// Stamp final match priorities: the class base, adjusted by the
    /// caller's priority, one step stronger for tunnelled matches.
    fn update_priority(&mut self, attr: &FlowAttr) {
        if self.drop {
            if let Some(desc) = &mut self.classes[HashClass::Eth.index()].buf {
                desc.set_priority(attr.priority + HashClass::Eth.flow_priority());
            }
            return;
        }
        let inner_boost = u16::from(self.inner != 0);
        for class in HASH_CLASSES {
            if let Some(desc) = &mut self.classes[class.index()].buf {
                desc.set_priority(attr.priority + class.flow_priority() - inner_boost);
            }
        }
    }

    pub(crate) fn class_buf(&self, class: HashClass) -> Option<&Descriptor> {
        self.classes[class.index()].buf.as_ref()
    }

    pub(crate) fn populated_classes(&self) -> impl Iterator<Item = HashClass> + '_ {
        HASH_CLASSES
            .into_iter()
            .filter(|c| self.classes[c.index()].buf.is_some())
    }
}
