use crate::error::UpdaterError;
use crate::platform::build_number::BuildNumber;
use crate::platform::model::{Build, Channel, ChannelStatus, Product, TargetOs};
use crate::settings::UpdateSettings;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

/// Customization points for platform update selection.
pub trait UpdatePolicy: Send + Sync {
    /// Whether builds of this channel may be offered under the selected tier.
    fn is_channel_applicable(&self, channel: &Channel, selected: ChannelStatus) -> bool {
        channel.status >= selected
    }

    /// Order in which channels are considered; earlier channels win ties.
    fn channel_order(&self, a: &Channel, b: &Channel) -> Ordering {
        a.status.cmp(&b.status)
    }

    fn is_newer(&self, candidate: &BuildNumber, current: &BuildNumber) -> bool {
        candidate > current
    }

    /// Whether patches of this channel may be used as intermediate hops.
    fn can_use_for_patch_chain(&self, channel: &Channel, selected: ChannelStatus) -> bool {
        self.is_channel_applicable(channel, selected)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultUpdatePolicy;

impl UpdatePolicy for DefaultUpdatePolicy {}

/// Builds to go through, starting with the current one, and the summed patch
/// size. The size is unknown as soon as one hop lacks a parsable size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateChain {
    pub builds: Vec<BuildNumber>,
    pub size: Option<String>,
}

#[derive(Debug)]
pub enum PlatformUpdateResult {
    Empty,
    Loaded {
        new_build: Build,
        channel: Channel,
        chain: Option<UpdateChain>,
    },
    ConnectionError {
        cause: UpdaterError,
    },
}

/// Pick the best build to update to from `product`, if any.
pub fn resolve(
    current: &BuildNumber,
    product: Option<&Product>,
    settings: &UpdateSettings,
    policy: &dyn UpdatePolicy,
) -> PlatformUpdateResult {
    let Some(product) = product.filter(|p| !p.channels.is_empty()) else {
        return PlatformUpdateResult::Empty;
    };

    let mut channels = product
        .channels
        .iter()
        .filter(|channel| policy.is_channel_applicable(channel, settings.selected_channel))
        .collect::<Vec<_>>();
    channels.sort_by(|a, b| policy.channel_order(a, b));

    // Keep the first of equal candidates so earlier channels win ties.
    let selected = channels
        .iter()
        .flat_map(|channel| channel.builds.iter().map(move |build| (build, *channel)))
        .filter(|(build, _)| is_applicable(build, current, settings, policy))
        .fold(None::<(&Build, &Channel)>, |best, candidate| match best {
            Some(best) if compare_candidates(current, candidate.0, best.0) != Ordering::Greater => {
                Some(best)
            }
            _ => Some(candidate),
        });

    let Some((build, channel)) = selected else {
        return PlatformUpdateResult::Empty;
    };

    tracing::debug!(
        "Selected build {} from channel {} for current build {}",
        build.number,
        channel.id,
        current
    );

    let chain = compute_update_chain(current, build, product, settings, policy);

    PlatformUpdateResult::Loaded {
        new_build: build.clone(),
        channel: channel.clone(),
        chain,
    }
}

fn is_applicable(
    build: &Build,
    current: &BuildNumber,
    settings: &UpdateSettings,
    policy: &dyn UpdatePolicy,
) -> bool {
    policy.is_newer(&build.number, current)
        && !settings.is_build_ignored(&build.number)
        && build.target.contains(current)
}

/// Same-baseline builds beat everything else, then plain build order.
fn compare_candidates(current: &BuildNumber, a: &Build, b: &Build) -> Ordering {
    let same_baseline = |build: &Build| build.number.baseline() == current.baseline();

    same_baseline(a)
        .cmp(&same_baseline(b))
        .then_with(|| a.number.cmp(&b.number))
}

/// Find the patches leading from `current` to `target`.
///
/// A direct patch is used as is. Otherwise the path with the fewest hops over
/// all available patches of eligible channels is taken; paths of two builds
/// or less are not reported as chains.
pub fn compute_update_chain(
    current: &BuildNumber,
    target: &Build,
    product: &Product,
    settings: &UpdateSettings,
    policy: &dyn UpdatePolicy,
) -> Option<UpdateChain> {
    if let Some(patch) = target.patch_from(current, settings.os) {
        return Some(UpdateChain {
            builds: vec![current.clone(), target.number.clone()],
            size: patch.size.clone(),
        });
    }

    let eligible_builds = product
        .channels
        .iter()
        .filter(|channel| policy.can_use_for_patch_chain(channel, settings.selected_channel))
        .flat_map(|channel| channel.builds.iter())
        .chain(std::iter::once(target));

    let graph = InboundGraph::from_builds(eligible_builds, settings.os);
    let path = graph.shortest_path(current, &target.number)?;

    if path.len() <= 2 {
        return None;
    }

    // Unknown or overflowing totals are reported as unknown.
    let size = path.windows(2).try_fold(0u64, |total, hop| {
        let hop_size = graph.edge_size(&hop[0], &hop[1]).and_then(parse_patch_size)?;
        total.checked_add(hop_size)
    });

    Some(UpdateChain {
        builds: path,
        size: size.map(|s| s.to_string()),
    })
}

/// The largest number mentioned in a free-text size such as `"from 10 to 15"`.
pub fn parse_patch_size(size: &str) -> Option<u64> {
    size.split(|c: char| !c.is_ascii_digit())
        .filter_map(|token| token.parse::<u64>().ok())
        .max()
}

struct InboundEdge<'a> {
    from: BuildNumber,
    size: Option<&'a str>,
}

/// Patches keyed by the build they lead to.
struct InboundGraph<'a> {
    edges: HashMap<BuildNumber, Vec<InboundEdge<'a>>>,
}

impl<'a> InboundGraph<'a> {
    fn from_builds(builds: impl Iterator<Item = &'a Build>, os: TargetOs) -> Self {
        let mut edges: HashMap<BuildNumber, Vec<InboundEdge<'a>>> = HashMap::new();

        for build in builds {
            let inbound = edges.entry(build.number.clone()).or_default();

            for patch in build.patches.iter().filter(|p| p.is_available_for(os)) {
                if inbound.iter().any(|edge| edge.from == patch.from) {
                    continue;
                }

                inbound.push(InboundEdge {
                    from: patch.from.clone(),
                    size: patch.size.as_deref(),
                });
            }
        }

        Self { edges }
    }

    fn edge_size(&self, from: &BuildNumber, to: &BuildNumber) -> Option<&'a str> {
        self.edges
            .get(to)?
            .iter()
            .find(|edge| edge.from == *from)
            .and_then(|edge| edge.size)
    }

    /// Breadth-first search walking patches backwards from `to`.
    fn shortest_path(&self, from: &BuildNumber, to: &BuildNumber) -> Option<Vec<BuildNumber>> {
        let mut next_hop: HashMap<BuildNumber, BuildNumber> = HashMap::new();
        let mut visited = HashSet::from([to.clone()]);
        let mut queue = VecDeque::from([to.clone()]);

        while let Some(node) = queue.pop_front() {
            if node == *from {
                let mut path = vec![node.clone()];
                let mut cursor = &node;
                while let Some(next) = next_hop.get(cursor) {
                    path.push(next.clone());
                    cursor = next;
                }
                return Some(path);
            }

            for edge in self.edges.get(&node).into_iter().flatten() {
                if visited.insert(edge.from.clone()) {
                    next_hop.insert(edge.from.clone(), node.clone());
                    queue.push_back(edge.from.clone());
                }
            }
        }

        None
    }
}
