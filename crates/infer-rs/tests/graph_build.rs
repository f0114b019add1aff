use std::sync::Arc;

use infer_rs::{CpuRuntime, DType, Graph, GraphError, OpKind, Runtime, Shape, Tensor};

fn cpu_graph() -> Graph {
    Graph::new(Arc::new(CpuRuntime::new()))
}

#[test]
fn wiring_links_tensors_and_operators() {
    let mut graph = cpu_graph();
    let x = graph.add_tensor(Shape::new([2, 3]), DType::F32);
    let first = graph.relu(x).unwrap();
    let mid = graph.op_output(first, 0);
    let second = graph.relu(mid).unwrap();

    assert_eq!(graph.tensor(x).targets(), &[first]);
    assert_eq!(graph.tensor(x).source(), None);
    assert_eq!(graph.tensor(mid).source(), Some(first));
    assert_eq!(graph.tensor(mid).targets(), &[second]);
    assert_eq!(graph.op(first).successors(), &[second]);
    assert_eq!(graph.op(second).predecessors(), &[first]);
    assert!(graph.op(first).predecessors().is_empty());
    graph.check_valid().unwrap();
}

#[test]
fn duplicate_input_slots_keep_multiset_counts() {
    let mut graph = cpu_graph();
    let x = graph.add_tensor(Shape::new([2, 3]), DType::F32);
    let sum = graph.add(x, x).unwrap();

    let op = graph.op(sum);
    assert_eq!(op.num_inputs(), 2);
    assert_eq!(graph.tensor(x).targets(), &[sum, sum]);
    graph.check_valid().unwrap();
}

#[test]
fn op_constructors_infer_output_shapes_eagerly() {
    let mut graph = cpu_graph();
    let a = graph.add_tensor(Shape::new([2, 3, 4]), DType::F32);
    let b = graph.add_tensor(Shape::new([2, 4, 5]), DType::F32);
    let mm = graph.matmul(a, b, false, false).unwrap();
    let out = graph.op_output(mm, 0);
    assert_eq!(graph.tensor(out).dims(), &[2, 3, 5]);
    assert_eq!(graph.tensor(out).dtype(), DType::F32);
}

#[test]
fn misconfigured_constructor_surfaces_the_shape_error() {
    let mut graph = cpu_graph();
    let a = graph.add_tensor(Shape::new([2, 3, 4]), DType::F32);
    let b = graph.add_tensor(Shape::new([2, 7, 5]), DType::F32);
    let err = graph
        .matmul(a, b, false, false)
        .expect_err("k mismatch should fail at construction");
    assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    // The failed constructor leaves no operator behind.
    assert!(graph.ops().is_empty());
}

#[test]
fn topo_sort_orders_predecessors_first() {
    let mut graph = cpu_graph();
    let t0 = graph.add_tensor(Shape::new([2, 2]), DType::F32);
    let t1 = graph.add_tensor(Shape::new([2, 2]), DType::F32);
    let t2 = graph.add_tensor(Shape::new([2, 2]), DType::F32);
    // The consumer is inserted before its producer.
    let late = graph.add_op_with_outputs(OpKind::Relu, &[t1], &[t2]).unwrap();
    let early = graph.add_op_with_outputs(OpKind::Relu, &[t0], &[t1]).unwrap();

    graph.topo_sort().unwrap();
    let order: Vec<_> = graph.ops().iter().map(|op| op.id()).collect();
    assert_eq!(order, vec![early, late]);

    // Invariant: every predecessor sits strictly before its dependents.
    for (position, op) in graph.ops().iter().enumerate() {
        for &pred in op.predecessors() {
            let pred_position = graph
                .ops()
                .iter()
                .position(|candidate| candidate.id() == pred)
                .expect("predecessor must be in the graph");
            assert!(pred_position < position);
        }
    }
}

#[test]
fn topo_sort_is_stable_for_ready_operators() {
    let mut graph = cpu_graph();
    let a = graph.add_tensor(Shape::new([2]), DType::F32);
    let b = graph.add_tensor(Shape::new([2]), DType::F32);
    let first = graph.relu(a).unwrap();
    let second = graph.relu(b).unwrap();
    graph.topo_sort().unwrap();
    let order: Vec<_> = graph.ops().iter().map(|op| op.id()).collect();
    assert_eq!(order, vec![first, second]);
}

#[test]
fn topo_sort_reports_cycles() {
    let mut graph = cpu_graph();
    let t0 = graph.add_tensor(Shape::new([2]), DType::F32);
    let t1 = graph.add_tensor(Shape::new([2]), DType::F32);
    graph.add_op_with_outputs(OpKind::Relu, &[t0], &[t1]).unwrap();
    graph.add_op_with_outputs(OpKind::Relu, &[t1], &[t0]).unwrap();
    let err = graph.topo_sort().expect_err("a cycle cannot be scheduled");
    assert!(matches!(err, GraphError::GraphHasCycle));
}

#[test]
fn shape_infer_reconciles_declared_output_shapes() {
    let mut graph = cpu_graph();
    let x = graph.add_tensor(Shape::new([2, 3]), DType::F32);
    // Declared with a placeholder shape; inference must correct it.
    let y = graph.add_tensor(Shape::new([1]), DType::F32);
    graph.add_op_with_outputs(OpKind::Relu, &[x], &[y]).unwrap();
    graph.shape_infer().unwrap();
    assert_eq!(graph.tensor(y).dims(), &[2, 3]);
}

#[test]
fn shape_infer_matches_stored_shapes_everywhere() {
    let mut graph = cpu_graph();
    let a = graph.add_tensor(Shape::new([2, 3, 4]), DType::F32);
    let b = graph.add_tensor(Shape::new([2, 5, 4]), DType::F32);
    let cat = graph.concat(&[a, b], 1).unwrap();
    let mm_rhs = graph.add_tensor(Shape::new([2, 4, 6]), DType::F32);
    graph.matmul(graph.op_output(cat, 0), mm_rhs, false, false).unwrap();

    graph.shape_infer().unwrap();
    for op in graph.ops() {
        let input_shapes: Vec<Shape> = op
            .inputs()
            .iter()
            .map(|&input| graph.tensor(input).shape().clone())
            .collect();
        let inferred = op.infer_shape(&input_shapes).unwrap();
        for (&output, shape) in op.outputs().iter().zip(&inferred) {
            assert_eq!(graph.tensor(output).shape(), shape);
        }
    }
}

#[test]
fn validator_rejects_orphan_tensors() {
    let mut graph = cpu_graph();
    graph.add_tensor(Shape::new([2]), DType::F32);
    let err = graph
        .check_valid()
        .expect_err("a tensor with no endpoints is invalid");
    assert!(matches!(err, GraphError::ValidationFailed(_)));
}

#[test]
fn external_tensors_must_share_the_runtime() {
    let runtime: Arc<dyn Runtime> = Arc::new(CpuRuntime::new());
    let foreign_runtime: Arc<dyn Runtime> = Arc::new(CpuRuntime::new());
    let mut graph = Graph::new(Arc::clone(&runtime));

    let foreign = Tensor::new(Shape::new([2]), DType::F32, foreign_runtime);
    let err = graph
        .add_external_tensor(foreign)
        .expect_err("foreign runtime must be rejected");
    assert!(matches!(err, GraphError::RuntimeMismatch { .. }));

    let local = Tensor::new(Shape::new([2]), DType::F32, Arc::clone(&runtime));
    let id = local.id();
    assert_eq!(graph.add_external_tensor(local).unwrap(), id);
}

#[test]
fn fuid_is_stable_under_detached_clone() {
    let runtime: Arc<dyn Runtime> = Arc::new(CpuRuntime::new());
    let mut graph = Graph::new(Arc::clone(&runtime));
    let x = graph.add_tensor(Shape::new([2, 2]), DType::F32);
    let fuid = graph.tensor(x).fuid();

    let clone = graph.tensor(x).clone_detached();
    assert_eq!(clone.fuid(), fuid);
    assert_ne!(clone.id(), x);

    let mut other = Graph::new(runtime);
    let adopted = other.add_external_tensor(clone).unwrap();
    assert_eq!(other.tensor_by_fuid(fuid).unwrap().id(), adopted);
}

#[test]
fn clone_op_recreates_outputs() {
    let mut graph = cpu_graph();
    let a = graph.add_tensor(Shape::new([2, 3, 4]), DType::F32);
    let b = graph.add_tensor(Shape::new([2, 4, 5]), DType::F32);
    let mm = graph.matmul(a, b, true, false).unwrap();
    let copy = graph.clone_op(mm).unwrap();

    assert_ne!(copy, mm);
    assert_eq!(graph.op(copy).kind(), graph.op(mm).kind());
    assert_eq!(graph.op(copy).inputs(), graph.op(mm).inputs());
    let (original, duplicate) = (graph.op_output(mm, 0), graph.op_output(copy, 0));
    assert_ne!(original, duplicate);
    assert_eq!(graph.tensor(original).shape(), graph.tensor(duplicate).shape());
    // Each input now feeds both operators.
    assert_eq!(graph.tensor(a).targets(), &[mm, copy]);
    graph.check_valid().unwrap();
}

#[test]
fn inputs_and_outputs_reflect_the_wiring() {
    let mut graph = cpu_graph();
    let a = graph.add_tensor(Shape::new([2, 3, 4]), DType::F32);
    let b = graph.add_tensor(Shape::new([2, 4, 5]), DType::F32);
    let mm = graph.matmul(a, b, false, false).unwrap();
    let out = graph.op_output(mm, 0);

    assert_eq!(graph.inputs(), vec![a, b]);
    assert_eq!(graph.outputs(), vec![out]);
}

#[test]
fn display_lists_tensors_and_operators() {
    let mut graph = cpu_graph();
    let x = graph.add_tensor(Shape::new([2]), DType::F32);
    graph.relu(x).unwrap();
    let rendered = format!("{graph}");
    assert!(rendered.contains("Graph tensors:"));
    assert!(rendered.contains("Graph operators:"));
    assert!(rendered.contains("Relu"));
}
