//! Key-to-partition routing and owner resolution overhead benchmarking.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use gridset::{to_data, Data, GridError, PartitionTable};

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};

static PARTITION_COUNTS: [u32; 3] = [71, 271, 1021];
static MEMBER_COUNTS: [u16; 3] = [3, 8, 32];

struct BenchId(pub u32, pub u16);

impl fmt::Display for BenchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}p@{}m", self.0, self.1)
    }
}

fn routing_table(
    partitions: u32,
    members: u16,
) -> Result<PartitionTable, GridError> {
    let table = PartitionTable::new(partitions)?;
    let members: Vec<SocketAddr> = (0..members)
        .map(|i| SocketAddr::from(([127, 0, 0, 1], 5701 + i)))
        .collect();
    table.assign_round_robin(&members, 1)?;
    Ok(table)
}

fn route_keys(table: &PartitionTable, keys: &[Data]) -> Result<(), GridError> {
    for key in keys {
        let partition = table.partition_id_for_key(key);
        black_box(table.owner_of(partition)?);
    }
    Ok(())
}

fn routing_bench_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing_bench");
    group
        .sample_size(50)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(3));

    let keys: Vec<Data> = (0..1000u64)
        .map(|k| to_data(&format!("key-{}", k)).unwrap())
        .collect();

    for partitions in PARTITION_COUNTS {
        for members in MEMBER_COUNTS {
            let table = routing_table(partitions, members).unwrap();
            group.bench_with_input(
                BenchmarkId::from_parameter(BenchId(partitions, members)),
                &table,
                |b, table| {
                    b.iter(|| route_keys(table, &keys));
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, routing_bench_group);
criterion_main!(benches);
