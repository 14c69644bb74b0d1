//! Contour extraction and polygon geometry.
//!
//! Border following over a binary image yields both outer borders of
//! white regions and the borders of their holes; the marker detector
//! relies on the hole borders (a dark marker on light paper appears as a
//! hole) and the document detector on the outer borders of edge blobs.

/// An integer pixel location, `(x, y)`.
pub type PointI = (i32, i32);

/// Whether a traced border encloses foreground or a hole in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderKind {
    Outer,
    Hole,
}

/// A traced border: the ordered pixel chain and its kind.
#[derive(Debug, Clone)]
pub struct Contour {
    pub points: Vec<PointI>,
    pub kind: BorderKind,
}

// 8-neighbourhood in clockwise order (image coordinates, y down),
// starting east.
const NEIGHBOURS: [(i32, i32); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

fn neighbour_index(from: PointI, to: PointI) -> usize {
    let d = (to.0 - from.0, to.1 - from.1);
    NEIGHBOURS
        .iter()
        .position(|&n| n == d)
        .expect("neighbour offset")
}

/// Trace every border in a binary image (non-zero = foreground) with the
/// raster-scan border-following algorithm.
pub fn find_contours(binary: &image::GrayImage) -> Vec<Contour> {
    let w = binary.width() as i32;
    let h = binary.height() as i32;
    let mut f: Vec<i32> = binary.as_raw().iter().map(|&v| i32::from(v > 0)).collect();
    let at = |f: &Vec<i32>, x: i32, y: i32| -> i32 {
        if x < 0 || y < 0 || x >= w || y >= h {
            0
        } else {
            f[(y * w + x) as usize]
        }
    };

    let mut contours = Vec::new();
    let mut nbd = 1;

    for y in 0..h {
        for x in 0..w {
            let v = at(&f, x, y);
            let (kind, start_neighbour) = if v == 1 && at(&f, x - 1, y) == 0 {
                (BorderKind::Outer, (x - 1, y))
            } else if v >= 1 && at(&f, x + 1, y) == 0 {
                (BorderKind::Hole, (x + 1, y))
            } else {
                continue;
            };

            nbd += 1;
            let points = trace_border(&mut f, w, h, (x, y), start_neighbour, nbd);
            contours.push(Contour { points, kind });
        }
    }

    contours
}

fn trace_border(
    f: &mut Vec<i32>,
    w: i32,
    h: i32,
    start: PointI,
    from: PointI,
    nbd: i32,
) -> Vec<PointI> {
    let get = |f: &Vec<i32>, p: PointI| -> i32 {
        if p.0 < 0 || p.1 < 0 || p.0 >= w || p.1 >= h {
            0
        } else {
            f[(p.1 * w + p.0) as usize]
        }
    };
    let set = |f: &mut Vec<i32>, p: PointI, v: i32| {
        f[(p.1 * w + p.0) as usize] = v;
    };

    // Clockwise search for the first non-zero neighbour.
    let start_idx = neighbour_index(start, from);
    let mut first = None;
    for step in 0..8 {
        let idx = (start_idx + step) % 8;
        let p = (start.0 + NEIGHBOURS[idx].0, start.1 + NEIGHBOURS[idx].1);
        if get(f, p) != 0 {
            first = Some(p);
            break;
        }
    }

    let Some(first) = first else {
        // Isolated pixel.
        set(f, start, -nbd);
        return vec![start];
    };

    let mut points = vec![start];
    let mut prev = first; // (i2, j2)
    let mut cur = start; // (i3, j3)

    loop {
        // Counter-clockwise search around `cur`, starting one past `prev`.
        let from_idx = neighbour_index(cur, prev);
        let mut next = None;
        let mut examined_east_zero = false;
        for step in 1..=8 {
            let idx = (from_idx + 8 - (step % 8)) % 8;
            let p = (cur.0 + NEIGHBOURS[idx].0, cur.1 + NEIGHBOURS[idx].1);
            if get(f, p) != 0 {
                next = Some(p);
                break;
            }
            if idx == 0 {
                examined_east_zero = true;
            }
        }
        let next = next.expect("border following found no neighbour");

        if examined_east_zero {
            set(f, cur, -nbd);
        } else if get(f, cur) == 1 {
            set(f, cur, nbd);
        }

        if next == start && cur == first {
            break;
        }

        points.push(next);
        prev = cur;
        cur = next;
    }

    // The closing revisit of the start pixel duplicates it; drop it.
    if points.len() > 1 && points.last() == Some(&start) {
        points.pop();
    }

    points
}

/// Signed shoelace area of a closed polygon; positive magnitude.
pub fn contour_area(points: &[PointI]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut acc = 0.0f64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        acc += a.0 as f64 * b.1 as f64 - b.0 as f64 * a.1 as f64;
    }
    (acc / 2.0).abs()
}

/// Closed perimeter length.
pub fn arc_length(points: &[PointI]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let mut acc = 0.0f64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        let (dx, dy) = ((b.0 - a.0) as f64, (b.1 - a.1) as f64);
        acc += (dx * dx + dy * dy).sqrt();
    }
    acc
}

fn point_line_distance(p: PointI, a: PointI, b: PointI) -> f64 {
    let (px, py) = (p.0 as f64, p.1 as f64);
    let (ax, ay) = (a.0 as f64, a.1 as f64);
    let (bx, by) = (b.0 as f64, b.1 as f64);
    let (dx, dy) = (bx - ax, by - ay);
    let len = (dx * dx + dy * dy).sqrt();
    if len < f64::EPSILON {
        let (ex, ey) = (px - ax, py - ay);
        return (ex * ex + ey * ey).sqrt();
    }
    ((px - ax) * dy - (py - ay) * dx).abs() / len
}

fn douglas_peucker(points: &[PointI], eps: f64, out: &mut Vec<PointI>) {
    if points.len() < 3 {
        out.extend_from_slice(points);
        return;
    }
    let (first, last) = (points[0], points[points.len() - 1]);
    let mut max_d = 0.0;
    let mut max_i = 0;
    for (i, &p) in points.iter().enumerate().skip(1).take(points.len() - 2) {
        let d = point_line_distance(p, first, last);
        if d > max_d {
            max_d = d;
            max_i = i;
        }
    }
    if max_d > eps {
        douglas_peucker(&points[..=max_i], eps, out);
        out.pop();
        douglas_peucker(&points[max_i..], eps, out);
    } else {
        out.push(first);
        out.push(last);
    }
}

/// Approximate a closed contour by a polygon with tolerance `eps`
/// (Douglas–Peucker, split at the point farthest from the start).
pub fn approx_polygon(points: &[PointI], eps: f64) -> Vec<PointI> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let anchor = points[0];
    let split = points
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            let da = dist_sq(anchor, **a);
            let db = dist_sq(anchor, **b);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0);

    if split == 0 {
        return points.to_vec();
    }

    let mut chain1 = Vec::new();
    douglas_peucker(&points[..=split], eps, &mut chain1);
    let mut wrapped: Vec<PointI> = points[split..].to_vec();
    wrapped.push(points[0]);
    let mut chain2 = Vec::new();
    douglas_peucker(&wrapped, eps, &mut chain2);

    // Join, dropping the duplicated split point and the closing anchor.
    chain1.pop();
    chain2.pop();
    chain1.extend(chain2);

    // The anchor and split points are raster positions, not necessarily
    // corners; prune any vertex that lies within tolerance of the line
    // through its neighbours.
    prune_collinear(&mut chain1, eps);
    chain1
}

fn prune_collinear(poly: &mut Vec<PointI>, eps: f64) {
    loop {
        if poly.len() <= 3 {
            return;
        }
        let n = poly.len();
        let mut removed = false;
        for i in 0..n {
            let prev = poly[(i + n - 1) % n];
            let next = poly[(i + 1) % n];
            if point_line_distance(poly[i], prev, next) <= eps {
                poly.remove(i);
                removed = true;
                break;
            }
        }
        if !removed {
            return;
        }
    }
}

fn dist_sq(a: PointI, b: PointI) -> f64 {
    let (dx, dy) = ((b.0 - a.0) as f64, (b.1 - a.1) as f64);
    dx * dx + dy * dy
}

/// Indices of the convex hull (Andrew monotone chain). Collinear points
/// are not part of the hull.
pub fn convex_hull_indices(points: &[PointI]) -> Vec<usize> {
    let n = points.len();
    if n < 3 {
        return (0..n).collect();
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| points[i]);
    order.dedup_by_key(|i| points[*i]);

    let cross = |o: PointI, a: PointI, b: PointI| -> i64 {
        (a.0 - o.0) as i64 * (b.1 - o.1) as i64 - (a.1 - o.1) as i64 * (b.0 - o.0) as i64
    };

    let chain = |indices: &mut dyn Iterator<Item = usize>| -> Vec<usize> {
        let mut half: Vec<usize> = Vec::new();
        for i in indices {
            while half.len() >= 2 {
                let o = points[half[half.len() - 2]];
                let a = points[half[half.len() - 1]];
                if cross(o, a, points[i]) <= 0 {
                    half.pop();
                } else {
                    break;
                }
            }
            half.push(i);
        }
        half
    };

    let mut lower = chain(&mut order.iter().copied());
    let mut upper = chain(&mut order.iter().rev().copied());
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// True when the polygon is convex (all turns the same way).
pub fn is_convex(points: &[PointI]) -> bool {
    let n = points.len();
    if n < 4 {
        return true;
    }
    let mut sign = 0i64;
    for i in 0..n {
        let o = points[i];
        let a = points[(i + 1) % n];
        let b = points[(i + 2) % n];
        let c = (a.0 - o.0) as i64 * (b.1 - a.1) as i64 - (a.1 - o.1) as i64 * (b.0 - a.0) as i64;
        if c != 0 {
            if sign == 0 {
                sign = c.signum();
            } else if sign != c.signum() {
                return false;
            }
        }
    }
    true
}

/// Axis-aligned bounding box `(x, y, width, height)`.
pub fn bounding_rect(points: &[PointI]) -> (i32, i32, i32, i32) {
    let min_x = points.iter().map(|p| p.0).min().unwrap_or(0);
    let max_x = points.iter().map(|p| p.0).max().unwrap_or(0);
    let min_y = points.iter().map(|p| p.1).min().unwrap_or(0);
    let max_y = points.iter().map(|p| p.1).max().unwrap_or(0);
    (min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
}
