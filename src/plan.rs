use crate::formats::ProcessedUnit;

/// A contiguous slice of processed units destined for one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// 1-based.
    pub index: usize,
    pub units: Vec<ProcessedUnit>,
}

impl Volume {
    pub fn first_position(&self) -> u64 {
        self.units.first().map(|unit| unit.position).unwrap_or_default()
    }

    pub fn last_position(&self) -> u64 {
        self.units.last().map(|unit| unit.position).unwrap_or_default()
    }
}

/// Splits units into volumes of at most `max_per_volume`, ordered by
/// sequence position. Zero, or a bound at least the unit count, gives a
/// single volume. No units gives no volumes.
pub fn plan_volumes(mut units: Vec<ProcessedUnit>, max_per_volume: usize) -> Vec<Volume> {
    if units.is_empty() {
        return Vec::new();
    }
    units.sort_by_key(|unit| unit.position);

    if max_per_volume == 0 || max_per_volume >= units.len() {
        return vec![Volume { index: 1, units }];
    }

    units
        .chunks(max_per_volume)
        .enumerate()
        .map(|(idx, chunk)| Volume {
            index: idx + 1,
            units: chunk.to_vec(),
        })
        .collect()
}

/// `<slug>_vol<index>_u<first>-<last>.epub`, stable for identical inputs.
pub fn volume_file_name(slug: &str, volume: &Volume) -> String {
    format!(
        "{slug}_vol{:03}_u{:05}-{:05}.epub",
        volume.index,
        volume.first_position(),
        volume.last_position()
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn units(count: u64) -> Vec<ProcessedUnit> {
        (0..count)
            .map(|position| ProcessedUnit {
                position,
                source_url: format!("https://example.com/chapter/{position}"),
                title: format!("Chapter {}", position + 1),
                path: PathBuf::from(format!("unit_{position}.xhtml")),
            })
            .collect()
    }

    fn sizes(volumes: &[Volume]) -> Vec<usize> {
        volumes.iter().map(|v| v.units.len()).collect()
    }

    #[test]
    fn splits_into_bounded_chunks_with_remainder() {
        let volumes = plan_volumes(units(125), 50);
        assert_eq!(sizes(&volumes), vec![50, 50, 25]);
        assert_eq!(
            volumes.iter().map(|v| v.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(volumes[2].first_position(), 100);
        assert_eq!(volumes[2].last_position(), 124);
    }

    #[test]
    fn zero_or_oversized_bound_gives_one_volume() {
        assert_eq!(sizes(&plan_volumes(units(125), 0)), vec![125]);
        assert_eq!(sizes(&plan_volumes(units(125), 500)), vec![125]);
        assert_eq!(sizes(&plan_volumes(units(50), 50)), vec![50]);
        assert!(plan_volumes(Vec::new(), 10).is_empty());
    }

    #[test]
    fn orders_by_position_not_file_name() {
        // Unpadded names would sort "unit_10000" before "unit_9999".
        let mut input = vec![
            ProcessedUnit {
                position: 10_000,
                source_url: "b".to_owned(),
                title: "b".to_owned(),
                path: PathBuf::from("unit_10000.xhtml"),
            },
            ProcessedUnit {
                position: 9_999,
                source_url: "a".to_owned(),
                title: "a".to_owned(),
                path: PathBuf::from("unit_9999.xhtml"),
            },
        ];
        input.push(ProcessedUnit {
            position: 3,
            source_url: "c".to_owned(),
            title: "c".to_owned(),
            path: PathBuf::from("unit_3.xhtml"),
        });
        let volumes = plan_volumes(input, 0);
        let order: Vec<u64> = volumes[0].units.iter().map(|u| u.position).collect();
        assert_eq!(order, vec![3, 9_999, 10_000]);
    }

    #[test]
    fn identical_inputs_give_identical_names() {
        let first = plan_volumes(units(7), 3);
        let second = plan_volumes(units(7), 3);
        assert_eq!(first, second);
        let names: Vec<String> = first.iter().map(|v| volume_file_name("s", v)).collect();
        assert_eq!(
            names,
            vec![
                "s_vol001_u00000-00002.epub",
                "s_vol002_u00003-00005.epub",
                "s_vol003_u00006-00006.epub",
            ]
        );
    }
}
