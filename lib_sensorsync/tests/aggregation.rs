use serde_json::json;

use lib_sensorsync::aggregate::aggregator::group_fragments;
use lib_sensorsync::aggregate::{AggregateOptions, EntityAggregator, Observation, Thing};
use lib_sensorsync::spatial::RootKind;

const URL: &str = "https://sta.example/v1.1/Things";

fn thing(value: serde_json::Value) -> Thing {
    serde_json::from_value(value).unwrap()
}

#[test]
fn fragments_of_one_thing_are_united() {
    let fragments = vec![
        thing(json!({
            "@iot.id": 7,
            "name": "gauge",
            "properties": {"foo": "bar"},
            "Locations": [{"location": {"type": "Point", "coordinates": [10.0, 53.5]}}],
            "Datastreams": [{"@iot.id": 1, "name": "level", "Observations": [{"result": 3.5}]}]
        })),
        thing(json!({
            "@iot.id": 7,
            "name": "gauge",
            "properties": {"foo": "baz"},
            "Datastreams": [{"@iot.id": 2, "name": "flow", "Observations": []}]
        })),
    ];

    let aggregator = EntityAggregator::new(AggregateOptions::default());
    let records = aggregator.aggregate(group_fragments(fragments), URL, "1.1");

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.properties["foo"], "bar | baz");
    assert_eq!(record.thing.datastreams.len(), 2);
    assert_eq!(record.summary.data_stream_id, "1 | 2");
    assert_eq!(record.summary.data_stream_name, "level | flow");
    assert_eq!(record.summary.data_stream_value, "3.5 | no data");
    assert_eq!(record.properties["requestUrl"], URL);
    assert_eq!(record.properties["requestVersion"], "1.1");
    assert_eq!(record.location, Some(json!({"type": "Point", "coordinates": [10.0, 53.5]})));
}

#[test]
fn flattened_fields_carry_value_and_time() {
    let aggregator = EntityAggregator::new(AggregateOptions::default());
    let records = aggregator
        .aggregate_values(
            vec![json!({
                "@iot.id": 1,
                "Datastreams": [{
                    "@iot.id": 4,
                    "name": "temp",
                    "Observations": [{"result": 21, "phenomenonTime": "2024-07-01T10:00:00Z"}]
                }]
            })],
            RootKind::Things,
            URL,
            "1.1",
        )
        .unwrap();

    let fields = &records[0].datastream_fields;
    assert_eq!(fields["dataStream_4_temp"], "21");
    assert_eq!(fields["dataStream_4_temp_phenomenonTime"], "01. Juli 2024, 12:00:00");
    assert_eq!(records[0].summary.checked_len().unwrap(), 1);
}

#[test]
fn datastream_rooted_results_are_re_rooted() {
    let aggregator = EntityAggregator::new(AggregateOptions::default());
    let records = aggregator
        .aggregate_values(
            vec![
                json!({"@iot.id": 10, "name": "temp", "Observations": [{"result": 1}],
                       "Thing": {"@iot.id": 1, "name": "north", "Locations": []}}),
                json!({"@iot.id": 11, "name": "hum", "Observations": [{"result": 2}],
                       "Thing": {"@iot.id": 1, "name": "north", "Locations": []}}),
                json!({"@iot.id": 12, "name": "wind", "Observations": [],
                       "Thing": {"@iot.id": 2, "name": "south", "Locations": []}}),
            ],
            RootKind::Datastreams,
            URL,
            "1.1",
        )
        .unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, "1");
    assert_eq!(records[0].summary.data_stream_id, "10 | 11");
    assert_eq!(records[0].summary.data_stream_value, "1 | 2");
    assert_eq!(records[0].properties["name"], "north");
    assert_eq!(records[1].summary.data_stream_id, "12");
}

#[test]
fn separator_bearing_values_keep_the_columns_aligned() {
    let aggregator = EntityAggregator::new(AggregateOptions::default());
    let mut records = aggregator
        .aggregate_values(
            vec![json!({
                "@iot.id": 1,
                "Datastreams": [
                    {"@iot.id": 1, "name": "state | mode", "Observations": [{"result": "on | auto"}]},
                    {"@iot.id": 2, "name": "level", "Observations": [{"result": 4}]}
                ]
            })],
            RootKind::Things,
            URL,
            "1.1",
        )
        .unwrap();
    let record = &mut records[0];
    assert_eq!(record.summary.data_stream_name, "state|mode | level");
    assert_eq!(record.summary.data_stream_value, "on|auto | 4");

    let pushed = Observation { result: json!("low | high"), ..Observation::default() };
    assert!(record.apply_observation("1", pushed, "low | high", "").unwrap());
    assert!(record.apply_observation("2", Observation::default(), "5", "").unwrap());

    assert_eq!(record.summary.data_stream_value, "low|high | 5");
    assert_eq!(record.summary.checked_len().unwrap(), 2);
    assert_eq!(record.datastream_fields["dataStream_1_state | mode"], "low | high");
    assert_eq!(record.datastream_fields.len(), 4);
}

#[test]
fn datastream_without_id_still_counts() {
    let aggregator = EntityAggregator::new(AggregateOptions::default());
    let records = aggregator
        .aggregate_values(
            vec![json!({"@iot.id": 1, "Datastreams": [{"name": "level", "Observations": [{"result": 2}]}]})],
            RootKind::Things,
            URL,
            "1.1",
        )
        .unwrap();
    assert_eq!(records[0].summary.data_stream_id, "");
    assert!(!records[0].summary.is_empty());
    assert_eq!(records[0].summary.ids(), vec![""]);
}
