//! Splits addresses into walkable street sides and numbers the stops on each.
//!
//! A side is every address sharing a street stem and house-number parity.
//! Sides come out in the order their first address appears, which follows
//! whatever route order the input already carried. Addresses without a stored
//! stop sequence come after all those with one, in list order.

use std::collections::HashMap;

use _model::{AddressRecord, Parity};
use serde::Serialize;
use uuid::Uuid;

const DIRECTIONALS: &[&str] = &[
    "n", "s", "e", "w", "ne", "nw", "se", "sw", "north", "south", "east", "west", "northeast",
    "northwest", "southeast", "southwest",
];

const SUFFIXES: &[&str] = &[
    "dr", "ave", "st", "rd", "cr", "blvd", "ln", "ct", "pl", "way", "cir", "drive", "avenue",
    "street", "road", "crescent", "boulevard", "lane", "court", "place", "circle",
];

pub const PALETTE: &[&str] = &[
    "#2563eb", "#dc2626", "#16a34a", "#d97706", "#7c3aed", "#0891b2", "#db2777", "#65a30d",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SequencedStop {
    /// Position in the input slice.
    pub index: usize,
    pub address_id: Uuid,
    pub house_number: Option<u32>,
    /// 1-based within the segment; unknown-parity stops have none.
    pub sequence: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub stem: String,
    pub street_name: String,
    pub parity: Parity,
    pub range: String,
    pub color: String,
    pub stops: Vec<SequencedStop>,
}

impl Segment {
    pub fn from_house(&self) -> Option<u32> {
        self.stops.iter().filter_map(|x| x.house_number).min()
    }

    pub fn to_house(&self) -> Option<u32> {
        self.stops.iter().filter_map(|x| x.house_number).max()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Sequence {
    pub segments: Vec<Segment>,
}

impl Sequence {
    /// Every stop, segment by segment.
    pub fn ordered(&self) -> impl Iterator<Item = (&Segment, &SequencedStop)> {
        self.segments
            .iter()
            .flat_map(|s| s.stops.iter().map(move |x| (s, x)))
    }
}

fn leading_number(raw: &str) -> Option<u32> {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(|x| x.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// House number, street number, then whatever number leads the street name or
/// the formatted address.
pub fn house_number(x: &AddressRecord) -> Option<u32> {
    [
        x.components.house_number.as_deref(),
        x.components.street_number.as_deref(),
        x.components.street_name.as_deref(),
        Some(x.formatted.as_str()),
    ]
    .into_iter()
    .flatten()
    .find_map(leading_number)
}

/// `"N Oak St."` -> `"oak"`. Blank names become `"unnamed"`.
pub fn street_stem(name: Option<&str>) -> String {
    let lower = name.unwrap_or_default().to_lowercase();
    let mut words: Vec<&str> = lower
        .split_whitespace()
        .map(|x| x.trim_matches(|c: char| c == '.' || c == ','))
        .filter(|x| !x.is_empty())
        .collect();

    if words.len() > 1 && DIRECTIONALS.contains(&words[0]) {
        words.remove(0);
    }
    if words.len() > 1 && words.last().is_some_and(|x| SUFFIXES.contains(x)) {
        words.pop();
    }

    if words.is_empty() {
        "unnamed".to_string()
    } else {
        words.join(" ")
    }
}

fn range_label(stops: &[SequencedStop]) -> String {
    let numbers: Vec<u32> = stops.iter().filter_map(|x| x.house_number).collect();
    match (numbers.iter().min(), numbers.iter().max()) {
        (Some(a), Some(b)) if a == b => a.to_string(),
        (Some(a), Some(b)) => format!("{a}–{b}"),
        _ => format!("{} homes", stops.len()),
    }
}

pub fn sequence(addresses: &[AddressRecord]) -> Sequence {
    struct Group {
        stem: String,
        street_name: String,
        parity: Parity,
        first: (bool, u32, usize),
        members: Vec<((bool, u32, usize), SequencedStop)>,
    }

    let mut groups: Vec<Group> = Vec::new();
    let mut index: HashMap<(String, Parity), usize> = HashMap::new();
    for (i, x) in addresses.iter().enumerate() {
        let stored = x.sequencing.stop_sequence;
        let order = (stored.is_none(), stored.unwrap_or(i as u32), i);
        let number = house_number(x);
        let parity = Parity::of(number);
        let stem = street_stem(x.components.street_name.as_deref());
        let stop = SequencedStop {
            index: i,
            address_id: x.id,
            house_number: number,
            sequence: None,
        };

        let slot = *index.entry((stem.clone(), parity)).or_insert_with(|| {
            groups.push(Group {
                street_name: x
                    .components
                    .street()
                    .map(str::to_string)
                    .unwrap_or_else(|| "Unnamed".to_string()),
                stem,
                parity,
                first: order,
                members: Vec::new(),
            });
            groups.len() - 1
        });
        let group = &mut groups[slot];
        group.first = group.first.min(order);
        group.members.push((order, stop));
    }

    groups.sort_by(|a, b| {
        (a.first, &a.stem, a.parity).cmp(&(b.first, &b.stem, b.parity))
    });

    let segments = groups
        .into_iter()
        .enumerate()
        .map(|(n, mut group)| {
            group.members.sort_by_key(|(order, _)| *order);
            let stops: Vec<SequencedStop> = group
                .members
                .into_iter()
                .enumerate()
                .map(|(k, (_, mut stop))| {
                    if group.parity.is_known() {
                        stop.sequence = Some(k as u32 + 1);
                    }
                    stop
                })
                .collect();
            Segment {
                range: range_label(&stops),
                color: PALETTE[n % PALETTE.len()].to_string(),
                stem: group.stem,
                street_name: group.street_name,
                parity: group.parity,
                stops,
            }
        })
        .collect();

    Sequence { segments }
}

#[cfg(test)]
mod tests {
    use _model::{AddressComponents, AddressSource};
    use geo::Point;

    use super::*;

    fn address(number: Option<&str>, street: &str) -> AddressRecord {
        AddressRecord::new(
            None,
            AddressComponents {
                house_number: number.map(str::to_string),
                street_name: Some(street.to_string()),
                ..Default::default()
            },
            Point::new(-79.4, 43.7),
            AddressSource::Authoritative,
        )
    }

    fn numbers(segment: &Segment) -> Vec<Option<u32>> {
        segment.stops.iter().map(|x| x.house_number).collect()
    }

    fn sequences(segment: &Segment) -> Vec<Option<u32>> {
        segment.stops.iter().map(|x| x.sequence).collect()
    }

    #[test]
    fn splits_oak_street_by_parity() {
        let input = vec![
            address(Some("12"), "Oak St"),
            address(Some("14"), "Oak St"),
            address(Some("11"), "Oak St"),
            address(None, "Oak St"),
        ];
        let x = sequence(&input);
        assert_eq!(x.segments.len(), 3);

        let even = &x.segments[0];
        assert_eq!((even.stem.as_str(), even.parity), ("oak", Parity::Even));
        assert_eq!(numbers(even), vec![Some(12), Some(14)]);
        assert_eq!(sequences(even), vec![Some(1), Some(2)]);
        assert_eq!(even.range, "12–14");

        let odd = &x.segments[1];
        assert_eq!(odd.parity, Parity::Odd);
        assert_eq!(numbers(odd), vec![Some(11)]);
        assert_eq!(sequences(odd), vec![Some(1)]);
        assert_eq!(odd.range, "11");

        let unknown = &x.segments[2];
        assert_eq!(unknown.parity, Parity::Unknown);
        assert_eq!(sequences(unknown), vec![None]);
        assert_eq!(unknown.range, "1 homes");
        assert_eq!(unknown.stops[0].address_id, input[3].id);
    }

    #[test]
    fn same_input_same_output() {
        let input: Vec<_> = ["5", "2", "7", "4", "x", "9"]
            .iter()
            .zip(["Elm Ave", "N Elm Avenue", "Birch Rd", "Elm Ave", "Birch Rd", "elm"])
            .map(|(n, s)| address(Some(n), s))
            .collect();
        assert_eq!(sequence(&input), sequence(&input));

        let x = sequence(&input);
        let elm_odd = x
            .segments
            .iter()
            .find(|s| s.stem == "elm" && s.parity == Parity::Odd)
            .unwrap();
        assert_eq!(numbers(elm_odd), vec![Some(5), Some(9)]);
    }

    #[test]
    fn existing_route_order_wins_over_position() {
        let mut input = vec![
            address(Some("2"), "Oak St"),
            address(Some("4"), "Oak St"),
            address(Some("1"), "Pine St"),
        ];
        input[0].sequencing.stop_sequence = Some(9);
        input[1].sequencing.stop_sequence = Some(3);
        input[2].sequencing.stop_sequence = Some(1);

        let x = sequence(&input);
        assert_eq!(x.segments[0].stem, "pine");
        assert_eq!(numbers(&x.segments[1]), vec![Some(4), Some(2)]);
        assert_eq!(sequences(&x.segments[1]), vec![Some(1), Some(2)]);
    }

    #[test]
    fn new_addresses_follow_the_stored_route() {
        let mut input = vec![
            address(Some("2"), "Oak St"),
            address(Some("4"), "Oak St"),
            address(Some("6"), "Oak St"),
            address(Some("1"), "Pine St"),
        ];
        input[1].sequencing.stop_sequence = Some(5);
        input[2].sequencing.stop_sequence = Some(9);

        let x = sequence(&input);
        assert_eq!(x.segments[0].stem, "oak");
        assert_eq!(numbers(&x.segments[0]), vec![Some(4), Some(6), Some(2)]);
        assert_eq!(x.segments[1].stem, "pine");
    }

    #[test]
    fn ordered_walks_segments_in_turn() {
        let input = vec![
            address(Some("1"), "Oak St"),
            address(Some("2"), "Oak St"),
            address(Some("3"), "Oak St"),
        ];
        let order: Vec<_> = sequence(&input).ordered().map(|(_, x)| x.index).collect();
        assert_eq!(order, vec![0, 2, 1]);
    }

    #[test]
    fn stems() {
        assert_eq!(street_stem(Some("Oak St")), "oak");
        assert_eq!(street_stem(Some("N. Main Street")), "main");
        assert_eq!(street_stem(Some("West Way")), "way");
        assert_eq!(street_stem(Some("Queen St E")), "queen st e");
        assert_eq!(street_stem(Some("Broadway")), "broadway");
        assert_eq!(street_stem(Some("   ")), "unnamed");
        assert_eq!(street_stem(None), "unnamed");
    }

    #[test]
    fn house_number_fallbacks() {
        let mut x = address(Some("12B"), "Oak St");
        assert_eq!(house_number(&x), Some(12));

        x.components.house_number = None;
        x.components.street_number = Some("40".to_string());
        assert_eq!(house_number(&x), Some(40));

        x.components.street_number = None;
        x.components.street_name = Some("77 Oak St".to_string());
        assert_eq!(house_number(&x), Some(77));

        x.components.street_name = Some("Oak St".to_string());
        x.formatted = "301 Oak St, Toronto".to_string();
        assert_eq!(house_number(&x), Some(301));

        x.formatted = "Oak St".to_string();
        assert_eq!(house_number(&x), None);
    }

    #[test]
    fn blank_streets_group_as_unnamed() {
        let x = sequence(&[address(Some("3"), ""), address(Some("5"), " ")]);
        assert_eq!(x.segments.len(), 1);
        assert_eq!(x.segments[0].stem, "unnamed");
        assert_eq!(x.segments[0].street_name, "Unnamed");
    }

    #[test]
    fn empty_input() {
        assert!(sequence(&[]).segments.is_empty());
    }
}
