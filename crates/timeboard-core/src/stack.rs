use chrono::{
  DateTime,
  Utc
};

use crate::model::ScheduledItem;

/// Lane assignment for one block.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub struct StackPlacement {
  /// Position within the overlap
  /// cluster, in order of appearance.
  pub index: usize,
  /// Number of blocks in the cluster.
  pub depth: usize
}

impl StackPlacement {
  const ALONE: Self = Self {
    index: 0,
    depth: 1
  };
}

struct Cluster {
  members: Vec<usize>,
  end:     DateTime<Utc>
}

/// Greedy single pass over time-sorted
/// items. Each item that starts before
/// the running end of the current
/// cluster takes the next index in it;
/// anything else opens a new cluster at
/// 0. Zero-length and unscheduled items
/// stand alone and leave the running
/// cluster untouched.
///
/// The result depends on input order for
/// items sharing a start time.
pub fn assign_stack_indices(
  items: &[&ScheduledItem]
) -> Vec<StackPlacement> {
  let mut out =
    vec![StackPlacement::ALONE; items.len()];
  let mut current: Option<Cluster> = None;

  for (pos, item) in
    items.iter().enumerate()
  {
    let (Some(start), Some(end)) = (
      item.scheduled_start,
      item.scheduled_end()
    ) else {
      continue;
    };
    if end <= start {
      continue;
    }

    let joins = current
      .as_ref()
      .is_some_and(|cluster| {
        start < cluster.end
      });

    if joins
      && let Some(cluster) =
        current.as_mut()
    {
      out[pos].index =
        cluster.members.len();
      cluster.members.push(pos);
      cluster.end = cluster.end.max(end);
      continue;
    }

    if let Some(done) = current.take() {
      close_cluster(&mut out, &done);
    }
    current = Some(Cluster {
      members: vec![pos],
      end
    });
  }

  if let Some(done) = current {
    close_cluster(&mut out, &done);
  }

  out
}

fn close_cluster(
  out: &mut [StackPlacement],
  cluster: &Cluster
) {
  let depth = cluster.members.len();
  for &member in &cluster.members {
    out[member].depth = depth;
  }
}
